//! Configuration types and loading.
//!
//! The config file is TOML, loaded once at startup and immutable
//! thereafter. Validation is fail-fast: an invalid threshold or an
//! ambiguous rule table aborts the run before any message is touched.
//! Credentials never live in the config file — they come from
//! environment variables (see `channels::email::EmailConfig` and the
//! classifier setup in `main`).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Classifier and fetch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Classification model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum unread messages fetched per run.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    /// Classifier request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Optional file overriding the built-in classifier instructions.
    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            fetch_limit: default_fetch_limit(),
            request_timeout_secs: default_request_timeout(),
            system_prompt_path: None,
        }
    }
}

/// Safety layer thresholds and policies.
#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    /// Minimum confidence for auto-send actions (Reply).
    #[serde(default = "default_auto_threshold")]
    pub min_confidence_for_auto_action: f64,
    /// Minimum confidence for any action at all.
    #[serde(default = "default_draft_threshold")]
    pub min_confidence_for_draft: f64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Senders we may reply to. `*` allows all; `@domain` or `domain`
    /// match a domain; a full address matches exactly.
    #[serde(default = "default_allowed_domains")]
    pub allowed_reply_domains: Vec<String>,
    /// Label applied when a message is flagged for human review.
    #[serde(default = "default_review_label")]
    pub review_label: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_confidence_for_auto_action: default_auto_threshold(),
            min_confidence_for_draft: default_draft_threshold(),
            rate_limit: RateLimitConfig::default(),
            allowed_reply_domains: default_allowed_domains(),
            review_label: default_review_label(),
        }
    }
}

/// Rolling-window rate limit for approved actions.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ceiling on approved actions within the window.
    #[serde(default = "default_max_actions")]
    pub max_actions: u32,
    /// Trailing window length in minutes.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_actions: default_max_actions(),
            window_minutes: default_window_minutes(),
        }
    }
}

/// Durable file locations.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Rate-limit state, rewritten after every approved action.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Append-only audit log, one JSON record per line.
    #[serde(default = "default_audit_path")]
    pub audit_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            audit_path: default_audit_path(),
        }
    }
}

/// One rule as written in the config file. Compiled into a typed
/// `Rule` at startup by `pipeline::rules::RuleTable::compile`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    /// Intent to match; absent or `*` is a wildcard.
    #[serde(default)]
    pub intent: Option<String>,
    /// Priority to match; absent or `*` is a wildcard.
    #[serde(default)]
    pub priority: Option<String>,
    pub action: ActionConfig,
    /// Lower evaluates first.
    #[serde(default = "default_rule_order")]
    pub order: i32,
}

/// Action specification inside a rule.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// Label name for `label` actions.
    #[serde(default)]
    pub value: Option<String>,
}

impl AppConfig {
    /// Load and validate the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check thresholds and limits. Rule-table compilation (including
    /// duplicate detection) happens in `RuleTable::compile`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let safety = &self.safety;
        for (key, value) in [
            (
                "safety.min_confidence_for_auto_action",
                safety.min_confidence_for_auto_action,
            ),
            (
                "safety.min_confidence_for_draft",
                safety.min_confidence_for_draft,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: format!("{value} is not within [0.0, 1.0]"),
                });
            }
        }

        if safety.min_confidence_for_draft > safety.min_confidence_for_auto_action {
            return Err(ConfigError::InvalidValue {
                key: "safety.min_confidence_for_draft".into(),
                message: "draft threshold must not exceed the auto-action threshold".into(),
            });
        }

        if safety.rate_limit.max_actions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "safety.rate_limit.max_actions".into(),
                message: "ceiling must be at least 1".into(),
            });
        }
        if safety.rate_limit.window_minutes <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "safety.rate_limit.window_minutes".into(),
                message: "window must be at least 1 minute".into(),
            });
        }

        if self.agent.fetch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "agent.fetch_limit".into(),
                message: "fetch limit must be at least 1".into(),
            });
        }

        Ok(())
    }
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_fetch_limit() -> usize {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_auto_threshold() -> f64 {
    0.85
}

fn default_draft_threshold() -> f64 {
    0.60
}

fn default_true() -> bool {
    true
}

fn default_max_actions() -> u32 {
    50
}

fn default_window_minutes() -> i64 {
    60
}

fn default_allowed_domains() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_review_label() -> String {
    "AI-REVIEW-NEEDED".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/safety_state.json")
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("data/audit_log.jsonl")
}

fn default_rule_order() -> i32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.safety.min_confidence_for_auto_action, 0.85);
        assert_eq!(config.safety.min_confidence_for_draft, 0.60);
        assert!(config.safety.rate_limit.enabled);
        assert_eq!(config.safety.rate_limit.max_actions, 50);
        assert_eq!(config.safety.rate_limit.window_minutes, 60);
        assert_eq!(config.safety.allowed_reply_domains, vec!["*"]);
        assert_eq!(config.agent.fetch_limit, 10);
        assert!(config.rules.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_full_config() {
        let raw = r#"
            [agent]
            model = "gemini-2.5-flash"
            fetch_limit = 20

            [safety]
            min_confidence_for_auto_action = 0.9
            min_confidence_for_draft = 0.5
            review_label = "NEEDS-REVIEW"

            [safety.rate_limit]
            enabled = true
            max_actions = 25
            window_minutes = 30

            [storage]
            state_path = "state/limits.json"
            audit_path = "state/audit.jsonl"

            [[rules]]
            name = "urgent-meeting"
            intent = "Meeting"
            priority = "High"
            order = 10
            action = { type = "reply" }

            [[rules]]
            name = "newsletter-archive"
            intent = "Newsletter"
            order = 20
            action = { type = "archive" }

            [[rules]]
            name = "spam-label"
            intent = "Spam"
            order = 30
            action = { type = "label", value = "Potential-Spam" }
        "#;

        let config: AppConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.safety.rate_limit.max_actions, 25);
        assert_eq!(config.rules.len(), 3);
        assert_eq!(config.rules[0].priority.as_deref(), Some("High"));
        assert_eq!(config.rules[1].intent.as_deref(), Some("Newsletter"));
        assert_eq!(config.rules[2].action.value.as_deref(), Some("Potential-Spam"));
        assert_eq!(config.storage.audit_path, PathBuf::from("state/audit.jsonl"));
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let mut config = AppConfig::default();
        config.safety.min_confidence_for_auto_action = 1.2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_draft_threshold_above_auto() {
        let mut config = AppConfig::default();
        config.safety.min_confidence_for_auto_action = 0.5;
        config.safety.min_confidence_for_draft = 0.7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_ceiling() {
        let mut config = AppConfig::default();
        config.safety.rate_limit.max_actions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_window() {
        let mut config = AppConfig::default();
        config.safety.rate_limit.window_minutes = 0;
        assert!(config.validate().is_err());
    }
}
