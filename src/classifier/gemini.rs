//! Gemini-backed classifier — HTTP client for the generateContent API.
//!
//! Sends a tight prompt with sender, subject, and body, and asks for a
//! strict JSON analysis. The response is tolerated hard: markdown
//! fences are stripped, unknown labels and missing confidence are
//! normalized, and every failure surfaces as a `ClassifierError` the
//! pipeline turns into a zero-confidence Unknown result.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::classifier::{ClassificationResult, Classifier, RawAnalysis};
use crate::error::ClassifierError;
use crate::pipeline::types::InboundEmail;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Keeps per-message token cost bounded — runs on every unread email.
const MAX_BODY_CHARS: usize = 4000;

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an email analysis engine. \
Analyze the email you are given and respond with ONLY a JSON object:\n\
{\"intent\": \"...\", \"priority\": \"...\", \"confidence\": 0.0, \
\"entities\": {...}, \"suggested_response\": \"...\", \"reasoning\": \"...\"}\n\n\
Rules:\n\
- intent is one of: Meeting, Urgent, Newsletter, Spam, Other\n\
- priority is one of: Low, Normal, High, Critical\n\
- confidence is your certainty in the intent/priority labels, 0.0 to 1.0\n\
- entities maps names to string values (e.g. a proposed meeting time)\n\
- suggested_response is a natural reply when one is warranted, else omit it\n\
- high confidence (>0.85) only when the intent is unambiguous";

/// HTTP classifier against a Gemini-style generateContent endpoint.
pub struct GeminiClassifier {
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    system_instruction: String,
}

impl GeminiClassifier {
    pub fn new(
        api_key: SecretString,
        model: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, ClassifierError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        })
    }

    /// Override the built-in analysis instructions.
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Point at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait::async_trait]
impl Classifier for GeminiClassifier {
    async fn classify(
        &self,
        email: &InboundEmail,
    ) -> Result<ClassificationResult, ClassifierError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = serde_json::json!({
            "system_instruction": {"parts": [{"text": self.system_instruction}]},
            "contents": [{"role": "user", "parts": [{"text": build_user_prompt(email)}]}],
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 1024,
                "responseMimeType": "application/json",
            },
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Request(format!(
                "{status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let payload: GenerateResponse = response.json().await?;
        let text = payload.first_text().ok_or(ClassifierError::EmptyResponse)?;

        debug!(model = %self.model, "Classifier responded");
        parse_analysis(&text)
    }
}

// ── Response handling ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn first_text(&self) -> Option<String> {
        let text = self
            .candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .first()?
            .text
            .trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }
}

/// Parse the model's analysis text into a normalized result.
pub(crate) fn parse_analysis(raw: &str) -> Result<ClassificationResult, ClassifierError> {
    let json = extract_json_object(raw);
    let analysis: RawAnalysis = serde_json::from_str(&json)
        .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;
    Ok(analysis.normalize())
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

// ── Prompt construction ─────────────────────────────────────────────

/// Format an email into the analysis prompt.
fn build_user_prompt(email: &InboundEmail) -> String {
    let body: String = email.body.chars().take(MAX_BODY_CHARS).collect();
    format!(
        "Input Email:\n[Sender]: {}\n[Subject]: {}\n[Body]:\n{}",
        email.sender,
        email.subject.as_deref().unwrap_or("(no subject)"),
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Intent, Priority};
    use chrono::Utc;

    fn email(subject: Option<&str>, body: &str) -> InboundEmail {
        InboundEmail {
            uid: "7".into(),
            message_id: "<t@x>".into(),
            sender: "alice@example.com".into(),
            subject: subject.map(String::from),
            body: body.into(),
            references: None,
            in_reply_to: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn parses_full_analysis() {
        let raw = r#"{
            "intent": "Meeting",
            "priority": "High",
            "confidence": 0.95,
            "entities": {"time": "tomorrow 10 AM"},
            "suggested_response": "Sure, let's meet.",
            "reasoning": "Sender requested a meeting unambiguously."
        }"#;
        let result = parse_analysis(raw).unwrap();
        assert_eq!(result.intent, Intent::Meeting);
        assert_eq!(result.priority, Priority::High);
        assert!((result.confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(result.entities.get("time").unwrap(), "tomorrow 10 AM");
        assert_eq!(result.suggested_response.as_deref(), Some("Sure, let's meet."));
    }

    #[test]
    fn accepts_confidence_score_alias() {
        let raw = r#"{"intent": "Spam", "priority": "Low", "confidence_score": 0.98}"#;
        let result = parse_analysis(raw).unwrap();
        assert_eq!(result.intent, Intent::Spam);
        assert!((result.confidence - 0.98).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_confidence_normalizes_to_zero() {
        let raw = r#"{"intent": "Other", "priority": "Low"}"#;
        let result = parse_analysis(raw).unwrap();
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn markdown_fenced_response_is_unwrapped() {
        let raw = "```json\n{\"intent\": \"Newsletter\", \"priority\": \"Low\", \"confidence\": 0.9}\n```";
        let result = parse_analysis(raw).unwrap();
        assert_eq!(result.intent, Intent::Newsletter);
    }

    #[test]
    fn bare_fence_is_unwrapped() {
        let raw = "```\n{\"intent\": \"Spam\", \"priority\": \"Low\", \"confidence\": 0.8}\n```";
        let result = parse_analysis(raw).unwrap();
        assert_eq!(result.intent, Intent::Spam);
    }

    #[test]
    fn json_embedded_in_prose_is_extracted() {
        let raw = "Here is my analysis: {\"intent\": \"Urgent\", \"priority\": \"Critical\", \"confidence\": 0.7} as requested.";
        let result = parse_analysis(raw).unwrap();
        assert_eq!(result.intent, Intent::Urgent);
        assert_eq!(result.priority, Priority::Critical);
    }

    #[test]
    fn non_json_response_is_malformed() {
        assert!(matches!(
            parse_analysis("I could not analyze this email."),
            Err(ClassifierError::MalformedResponse(_))
        ));
    }

    #[test]
    fn empty_object_normalizes_to_unknown() {
        let result = parse_analysis("{}").unwrap();
        assert_eq!(result.intent, Intent::Unknown);
        assert_eq!(result.priority, Priority::Unknown);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn prompt_includes_sender_subject_and_body() {
        let prompt = build_user_prompt(&email(Some("Team sync"), "Can we meet Tuesday?"));
        assert!(prompt.contains("alice@example.com"));
        assert!(prompt.contains("Team sync"));
        assert!(prompt.contains("Can we meet Tuesday?"));
    }

    #[test]
    fn prompt_handles_missing_subject() {
        let prompt = build_user_prompt(&email(None, "hello"));
        assert!(prompt.contains("(no subject)"));
    }

    #[test]
    fn prompt_truncates_long_bodies() {
        let long_body = "x".repeat(10_000);
        let prompt = build_user_prompt(&email(Some("big"), &long_body));
        assert!(prompt.len() < MAX_BODY_CHARS + 200);
    }

    #[test]
    fn system_instruction_names_the_contract_fields() {
        for field in ["intent", "priority", "confidence", "entities", "suggested_response"] {
            assert!(DEFAULT_SYSTEM_INSTRUCTION.contains(field), "missing {field}");
        }
    }
}
