//! Shared types for the decision pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::ClassificationResult;

// ── Inbound email ───────────────────────────────────────────────────

/// An unread message fetched from the mailbox.
///
/// The mailbox adapter converts its native format into this struct.
/// The pipeline processes it through classification → rules → gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEmail {
    /// Mailbox-native identifier (IMAP UID).
    pub uid: String,
    /// RFC 822 Message-ID header, used for reply threading.
    pub message_id: String,
    /// Sender address.
    pub sender: String,
    /// Subject line, if present.
    pub subject: Option<String>,
    /// Plain-text body.
    pub body: String,
    /// Existing References chain for threading, if any.
    pub references: Option<String>,
    /// In-Reply-To header, if any.
    pub in_reply_to: Option<String>,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

// ── Actions ─────────────────────────────────────────────────────────

/// An action the agent can take on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Auto-send a reply to the sender.
    Reply,
    /// Save a reply to the drafts folder for human review.
    Draft,
    /// Apply a mailbox label.
    Label { name: String },
    /// Archive the message out of the inbox.
    Archive,
    /// Take no action.
    NoOp,
}

impl ActionKind {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Draft => "draft",
            Self::Label { .. } => "label",
            Self::Archive => "archive",
            Self::NoOp => "noop",
        }
    }

    /// Whether this action does anything at all.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Whether this action produces an outbound artifact (a sent reply
    /// or a saved draft) that needs reply text as payload.
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Reply | Self::Draft)
    }
}

/// The rule engine's output, before safety evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCandidate {
    pub action: ActionKind,
    /// Name of the rule that produced this candidate.
    pub rule_id: String,
    /// Confidence carried through from the classification.
    pub confidence: f64,
}

// ── Safety verdict ──────────────────────────────────────────────────

/// Why the safety layer reached its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Action passed every gate (possibly a NoOp passing through).
    Approved,
    /// Reply downgraded to Draft: confidence below the auto-send threshold.
    BelowAutoThreshold,
    /// Action suppressed: confidence below the draft threshold.
    BelowDraftThreshold,
    /// Action suppressed: rolling-window ceiling reached, or the state
    /// store was unavailable (fail closed).
    RateLimited,
}

/// The safety layer's final, possibly downgraded, decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub final_action: ActionKind,
    pub reason: ReasonCode,
    /// Quota remaining in the current window after this decision.
    pub rate_limit_remaining: u32,
}

// ── Execution outcome ───────────────────────────────────────────────

/// What happened when the final action was carried out (or withheld).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The action was executed.
    Success,
    /// The executor failed; the message is left unresolved for retry.
    Failed { detail: String },
    /// Execution was skipped (NoOp verdict, missing payload, or a
    /// classification failure). Detail says why.
    Skipped { detail: String },
    /// Dry-run mode: the action would have been executed.
    Simulated,
}

impl ExecutionOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
            Self::Simulated => "simulated",
        }
    }
}

// ── Audit record ────────────────────────────────────────────────────

/// One immutable audit entry per processed message.
///
/// Never mutated or deleted after being written — the audit log is the
/// permanent record of what the agent decided and did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// RFC 822 Message-ID of the processed message.
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub classification: ClassificationResult,
    pub candidate: ActionCandidate,
    pub verdict: SafetyVerdict,
    pub outcome: ExecutionOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Intent, Priority};
    use std::collections::BTreeMap;

    #[test]
    fn action_kind_labels() {
        assert_eq!(ActionKind::Reply.label(), "reply");
        assert_eq!(ActionKind::Draft.label(), "draft");
        assert_eq!(
            ActionKind::Label {
                name: "Newsletters".into()
            }
            .label(),
            "label"
        );
        assert_eq!(ActionKind::Archive.label(), "archive");
        assert_eq!(ActionKind::NoOp.label(), "noop");
    }

    #[test]
    fn noop_is_not_actionable() {
        assert!(!ActionKind::NoOp.is_actionable());
        assert!(ActionKind::Archive.is_actionable());
        assert!(
            ActionKind::Label {
                name: "x".into()
            }
            .is_actionable()
        );
    }

    #[test]
    fn only_reply_and_draft_are_outbound() {
        assert!(ActionKind::Reply.is_outbound());
        assert!(ActionKind::Draft.is_outbound());
        assert!(!ActionKind::Archive.is_outbound());
        assert!(
            !ActionKind::Label {
                name: "x".into()
            }
            .is_outbound()
        );
        assert!(!ActionKind::NoOp.is_outbound());
    }

    #[test]
    fn action_kind_serialization() {
        let json = serde_json::to_value(&ActionKind::Label {
            name: "Urgent-Meeting".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "label");
        assert_eq!(json["name"], "Urgent-Meeting");

        let json = serde_json::to_value(&ActionKind::Reply).unwrap();
        assert_eq!(json["kind"], "reply");
    }

    #[test]
    fn audit_record_round_trips() {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message_id: "<abc@mail.example>".into(),
            subject: Some("Quarterly sync".into()),
            classification: ClassificationResult {
                intent: Intent::Meeting,
                priority: Priority::Normal,
                confidence: 0.92,
                entities: BTreeMap::new(),
                suggested_response: Some("Works for me.".into()),
                reasoning: None,
            },
            candidate: ActionCandidate {
                action: ActionKind::Reply,
                rule_id: "meeting-auto-reply".into(),
                confidence: 0.92,
            },
            verdict: SafetyVerdict {
                final_action: ActionKind::Reply,
                reason: ReasonCode::Approved,
                rate_limit_remaining: 49,
            },
            outcome: ExecutionOutcome::Success,
        };

        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        let back: AuditRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.message_id, record.message_id);
        assert_eq!(back.verdict, record.verdict);
        assert_eq!(back.outcome, ExecutionOutcome::Success);
    }
}
