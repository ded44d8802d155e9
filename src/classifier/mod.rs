//! Classification service integration.
//!
//! The classifier is an opaque external service with a typed response
//! contract: it labels a message with an intent, a priority, and a
//! confidence score. Everything downstream of it is deterministic —
//! the decision pipeline never lets classifier output trigger an
//! action directly.

pub mod gemini;

pub use gemini::GeminiClassifier;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;
use crate::pipeline::types::InboundEmail;

/// Categorical label describing the purpose of a message.
///
/// `Unknown` marks a missing or unrecognized label. It only matches
/// rules explicitly declared for `Unknown` or wildcard rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Meeting,
    Urgent,
    Newsletter,
    Spam,
    Other,
    Unknown,
}

impl Intent {
    /// Parse a config-file intent name. Strict — unrecognized names are
    /// a configuration error at the call site.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meeting" => Some(Self::Meeting),
            "urgent" => Some(Self::Urgent),
            "newsletter" => Some(Self::Newsletter),
            "spam" => Some(Self::Spam),
            "other" => Some(Self::Other),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Short label for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Meeting => "meeting",
            Self::Urgent => "urgent",
            Self::Newsletter => "newsletter",
            Self::Spam => "spam",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

/// Ordered message priority. `Unknown` sorts below `Low` and marks a
/// missing or unrecognized value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Unknown,
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Parse a config-file priority name. Strict — unrecognized names
    /// are a configuration error at the call site.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Short label for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Normalized classification result, consumed read-only by the pipeline.
///
/// `confidence` is always present and within [0.0, 1.0] — normalization
/// maps anything missing or non-numeric to 0.0, the fail-safe minimum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub intent: Intent,
    pub priority: Priority,
    pub confidence: f64,
    /// Extracted entities, e.g. a proposed meeting time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entities: BTreeMap<String, String>,
    /// Reply text proposed by the classifier — payload for Reply/Draft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
    /// Free-text rationale. Audit only, never used in decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ClassificationResult {
    /// Fail-safe fallback for a failed or unusable classification.
    ///
    /// Zero confidence guarantees the safety layer downgrades any
    /// candidate built from this result to NoOp.
    pub fn unknown(reasoning: impl Into<String>) -> Self {
        Self {
            intent: Intent::Unknown,
            priority: Priority::Unknown,
            confidence: 0.0,
            entities: BTreeMap::new(),
            suggested_response: None,
            reasoning: Some(reasoning.into()),
        }
    }
}

/// Wire-format analysis as the classification service reports it.
///
/// Field types are deliberately loose; [`RawAnalysis::normalize`] is a
/// total function from any shape the service produces to a well-formed
/// [`ClassificationResult`].
#[derive(Debug, Default, Deserialize)]
pub struct RawAnalysis {
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, alias = "confidence_score")]
    pub confidence: Option<serde_json::Value>,
    #[serde(default)]
    pub entities: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub suggested_response: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl RawAnalysis {
    /// Normalize into the typed result the pipeline consumes.
    ///
    /// Missing or unrecognized labels become `Unknown`; a missing,
    /// non-numeric, or non-finite confidence becomes 0.0 and
    /// out-of-range values are clamped into [0.0, 1.0].
    pub fn normalize(self) -> ClassificationResult {
        let intent = self
            .intent
            .as_deref()
            .and_then(Intent::parse)
            .unwrap_or(Intent::Unknown);
        let priority = self
            .priority
            .as_deref()
            .and_then(Priority::parse)
            .unwrap_or(Priority::Unknown);

        let confidence = self
            .confidence
            .as_ref()
            .and_then(serde_json::Value::as_f64)
            .filter(|c| c.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        let entities = self
            .entities
            .into_iter()
            .filter_map(|(name, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) if s.is_empty() => None,
                serde_json::Value::String(s) => Some((name, s)),
                other => Some((name, other.to_string())),
            })
            .collect();

        let suggested_response = self.suggested_response.filter(|s| !s.trim().is_empty());

        ClassificationResult {
            intent,
            priority,
            confidence,
            entities,
            suggested_response,
            reasoning: self.reasoning,
        }
    }
}

/// Classification service interface.
///
/// The pipeline treats any error as "confidence 0.0, intent Unknown" —
/// a fail-safe default, never a fail-open one.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, email: &InboundEmail) -> Result<ClassificationResult, ClassifierError>;
}
