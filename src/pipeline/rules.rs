//! Rule engine — ordered, deterministic (intent, priority) dispatch.
//!
//! Rules are compiled from config once at startup and immutable
//! thereafter. Evaluation is a pure, total function: first matching
//! rule wins, no match falls back to NoOp. Ambiguity (two rules with
//! the same matcher and order) is a load-time configuration error,
//! never a per-message surprise.

use tracing::{debug, warn};

use crate::classifier::{ClassificationResult, Intent, Priority};
use crate::config::RuleConfig;
use crate::error::ConfigError;
use crate::pipeline::types::{ActionCandidate, ActionKind};

/// Rule id used when no configured rule matches.
pub const FALLBACK_RULE_ID: &str = "fallback";

/// Predicate over (intent, priority). `None` is a wildcard.
///
/// A wildcard matches any value except `Unknown` — unclassifiable
/// messages only reach rules that name `Unknown` explicitly, or the
/// NoOp fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatcher {
    pub intent: Option<Intent>,
    pub priority: Option<Priority>,
}

impl RuleMatcher {
    fn matches(&self, intent: Intent, priority: Priority) -> bool {
        let intent_ok = match self.intent {
            Some(wanted) => wanted == intent,
            None => intent != Intent::Unknown,
        };
        let priority_ok = match self.priority {
            Some(wanted) => wanted == priority,
            None => priority != Priority::Unknown,
        };
        intent_ok && priority_ok
    }
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub matcher: RuleMatcher,
    pub action: ActionKind,
    pub order: i32,
}

/// Immutable, ordered rule table. Safe for unlimited concurrent reads.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    /// Compile config rules into a typed table.
    ///
    /// Fails fast on unknown intent/priority/action names, a `label`
    /// action without a value, and two rules sharing both matcher and
    /// order (the tie-break would otherwise be implicit).
    pub fn compile(configs: &[RuleConfig]) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(configs.len());

        for config in configs {
            let intent = parse_wildcard(config.intent.as_deref(), |s| {
                Intent::parse(s).ok_or_else(|| ConfigError::UnknownIntent {
                    rule: config.name.clone(),
                    value: s.to_string(),
                })
            })?;
            let priority = parse_wildcard(config.priority.as_deref(), |s| {
                Priority::parse(s).ok_or_else(|| ConfigError::UnknownPriority {
                    rule: config.name.clone(),
                    value: s.to_string(),
                })
            })?;

            let action = compile_action(config)?;

            rules.push(Rule {
                id: config.name.clone(),
                matcher: RuleMatcher { intent, priority },
                action,
                order: config.order,
            });
        }

        for (i, a) in rules.iter().enumerate() {
            for b in rules.iter().skip(i + 1) {
                if a.matcher == b.matcher && a.order == b.order {
                    return Err(ConfigError::DuplicateRule {
                        first: a.id.clone(),
                        second: b.id.clone(),
                    });
                }
            }
        }

        // Stable: declaration order breaks ties between distinct matchers.
        rules.sort_by_key(|r| r.order);

        Ok(Self { rules })
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Map a classification to a candidate action.
    ///
    /// Total function: always returns a candidate. Pure — no side
    /// effects beyond logging, so matching behavior is exhaustively
    /// testable without any external dependency.
    pub fn evaluate(&self, classification: &ClassificationResult) -> ActionCandidate {
        for rule in &self.rules {
            if rule
                .matcher
                .matches(classification.intent, classification.priority)
            {
                debug!(
                    rule = %rule.id,
                    action = rule.action.label(),
                    intent = classification.intent.name(),
                    priority = classification.priority.name(),
                    "Rule matched"
                );
                return ActionCandidate {
                    action: rule.action.clone(),
                    rule_id: rule.id.clone(),
                    confidence: classification.confidence,
                };
            }
        }

        warn!(
            intent = classification.intent.name(),
            priority = classification.priority.name(),
            "No rule matched, falling back to NoOp"
        );
        ActionCandidate {
            action: ActionKind::NoOp,
            rule_id: FALLBACK_RULE_ID.to_string(),
            confidence: classification.confidence,
        }
    }
}

fn parse_wildcard<T>(
    value: Option<&str>,
    parse: impl FnOnce(&str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some("*") => Ok(None),
        Some(s) => parse(s).map(Some),
    }
}

fn compile_action(config: &RuleConfig) -> Result<ActionKind, ConfigError> {
    match config.action.kind.trim().to_ascii_lowercase().as_str() {
        "reply" => Ok(ActionKind::Reply),
        "draft" | "draft_reply" => Ok(ActionKind::Draft),
        "label" => {
            let name = config
                .action
                .value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingActionValue {
                    rule: config.name.clone(),
                    value: "label".into(),
                })?;
            Ok(ActionKind::Label {
                name: name.to_string(),
            })
        }
        "archive" => Ok(ActionKind::Archive),
        "noop" | "none" => Ok(ActionKind::NoOp),
        other => Err(ConfigError::UnknownAction {
            rule: config.name.clone(),
            value: other.to_string(),
        }),
    }
}
