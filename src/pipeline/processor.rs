//! Decision pipeline — orchestrates classify → rules → gate → execute → audit.
//!
//! **Core invariant: classifier output never triggers an action
//! directly.** Every candidate passes through the safety layer, and
//! every processed message produces exactly one audit record — a
//! missing record is a defect, whatever else went wrong.
//!
//! Per-message flow:
//! 1. Classification (external service; failures become a
//!    zero-confidence Unknown result, never a crash)
//! 2. Rule engine → candidate action
//! 3. Safety layer → final verdict
//! 4. Executor (skipped for NoOp verdicts and in dry-run mode)
//! 5. Audit record

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::channels::{ActionExecutor, Mailbox};
use crate::classifier::{ClassificationResult, Classifier};
use crate::error::MailboxError;
use crate::pipeline::rules::RuleTable;
use crate::pipeline::types::{
    ActionKind, AuditRecord, ExecutionOutcome, InboundEmail, ReasonCode, SafetyVerdict,
};
use crate::safety::SafetyLayer;

/// How many classification calls may be in flight at once. Gating
/// stays strictly sequential regardless.
const CLASSIFY_CONCURRENCY: usize = 4;

/// Pipeline behavior switches.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Run through gating but never call the executor.
    pub dry_run: bool,
    /// Label applied when a message is suppressed for low confidence,
    /// so a human sees it. `None` disables flagging.
    pub review_label: Option<String>,
}

/// Result of processing one message through the pipeline.
#[derive(Debug, Clone)]
pub struct ProcessedDecision {
    pub message_id: String,
    pub verdict: SafetyVerdict,
    pub outcome: ExecutionOutcome,
    /// Whether the message may be marked read. Execution and
    /// classification failures leave it unresolved for the next run.
    pub resolved: bool,
}

/// The orchestrator. Composes the rule engine, safety layer, executor,
/// and audit log; owns no policy of its own.
pub struct DecisionPipeline {
    classifier: Arc<dyn Classifier>,
    executor: Arc<dyn ActionExecutor>,
    rules: RuleTable,
    safety: Arc<SafetyLayer>,
    audit: Arc<AuditLog>,
    options: PipelineOptions,
}

impl DecisionPipeline {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        executor: Arc<dyn ActionExecutor>,
        rules: RuleTable,
        safety: Arc<SafetyLayer>,
        audit: Arc<AuditLog>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            classifier,
            executor,
            rules,
            safety,
            audit,
            options,
        }
    }

    /// Process one message end to end: classify, then decide.
    pub async fn process(&self, email: &InboundEmail) -> ProcessedDecision {
        let (classification, classifier_error) = match self.classifier.classify(email).await {
            Ok(result) => (result, None),
            Err(e) => {
                warn!(
                    message_id = %email.message_id,
                    error = %e,
                    "Classification failed, substituting zero-confidence Unknown"
                );
                (ClassificationResult::unknown(e.to_string()), Some(e.to_string()))
            }
        };
        self.decide(email, classification, classifier_error).await
    }

    /// Run the decision half of the pipeline on an already-classified
    /// message: rules → gate → execute → audit.
    pub async fn decide(
        &self,
        email: &InboundEmail,
        classification: ClassificationResult,
        classifier_error: Option<String>,
    ) -> ProcessedDecision {
        info!(
            message_id = %email.message_id,
            sender = %email.sender,
            intent = classification.intent.name(),
            priority = classification.priority.name(),
            confidence = classification.confidence,
            "Processing message"
        );

        let candidate = self.rules.evaluate(&classification);
        let verdict = self.safety.gate(&candidate, Utc::now());

        debug!(
            message_id = %email.message_id,
            candidate = candidate.action.label(),
            rule = %candidate.rule_id,
            final_action = verdict.final_action.label(),
            remaining = verdict.rate_limit_remaining,
            "Safety verdict"
        );

        let outcome = if let Some(err) = &classifier_error {
            ExecutionOutcome::Skipped {
                detail: format!("classification failed: {err}"),
            }
        } else if !verdict.final_action.is_actionable() {
            self.flag_for_review(email, &verdict).await;
            ExecutionOutcome::Skipped {
                detail: skip_detail(verdict.reason),
            }
        } else if verdict.final_action.is_outbound()
            && classification.suggested_response.is_none()
        {
            warn!(
                message_id = %email.message_id,
                "No suggested reply text from the classifier, skipping outbound action"
            );
            ExecutionOutcome::Skipped {
                detail: "no suggested reply text".into(),
            }
        } else if self.options.dry_run {
            info!(
                message_id = %email.message_id,
                action = verdict.final_action.label(),
                "[dry run] Would execute action"
            );
            ExecutionOutcome::Simulated
        } else {
            let payload = classification.suggested_response.as_deref();
            match self
                .executor
                .execute(&verdict.final_action, email, payload)
                .await
            {
                Ok(()) => {
                    info!(
                        message_id = %email.message_id,
                        action = verdict.final_action.label(),
                        "Action executed"
                    );
                    ExecutionOutcome::Success
                }
                Err(e) => {
                    warn!(
                        message_id = %email.message_id,
                        action = verdict.final_action.label(),
                        error = %e,
                        "Action failed, leaving message unresolved"
                    );
                    ExecutionOutcome::Failed {
                        detail: e.to_string(),
                    }
                }
            }
        };

        // The one audit record for this message — every path above
        // funnels here before control returns.
        self.audit.record(&AuditRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message_id: email.message_id.clone(),
            subject: email.subject.clone(),
            classification,
            candidate,
            verdict: verdict.clone(),
            outcome: outcome.clone(),
        });

        let resolved = classifier_error.is_none()
            && !matches!(outcome, ExecutionOutcome::Failed { .. });

        ProcessedDecision {
            message_id: email.message_id.clone(),
            verdict,
            outcome,
            resolved,
        }
    }

    /// One poll cycle: fetch unread, classify (a few in flight at a
    /// time), then gate and execute strictly in sequence.
    ///
    /// A raised `shutdown` flag stops new messages from entering the
    /// decision stage; the in-flight one finishes and logs its outcome.
    pub async fn run_cycle(
        &self,
        mailbox: &dyn Mailbox,
        limit: usize,
        shutdown: &AtomicBool,
    ) -> Result<Vec<ProcessedDecision>, MailboxError> {
        let emails = mailbox.fetch_unread(limit).await?;
        info!(count = emails.len(), "Fetched unread messages");

        let classified = stream::iter(emails.into_iter().map(|email| async move {
            let result = self.classifier.classify(&email).await;
            (email, result)
        }))
        .buffered(CLASSIFY_CONCURRENCY);
        futures::pin_mut!(classified);

        let mut decisions = Vec::new();
        while let Some((email, result)) = classified.next().await {
            if shutdown.load(Ordering::Relaxed) {
                warn!("Shutdown requested, not starting further messages");
                break;
            }

            let (classification, classifier_error) = match result {
                Ok(c) => (c, None),
                Err(e) => {
                    warn!(
                        message_id = %email.message_id,
                        error = %e,
                        "Classification failed, substituting zero-confidence Unknown"
                    );
                    (ClassificationResult::unknown(e.to_string()), Some(e.to_string()))
                }
            };

            let decision = self.decide(&email, classification, classifier_error).await;

            // Dry runs leave the mailbox untouched; failures stay
            // unread so the next cycle retries them.
            if decision.resolved && !self.options.dry_run {
                if let Err(e) = mailbox.mark_read(&email).await {
                    warn!(message_id = %email.message_id, error = %e, "Failed to mark message read");
                }
            }

            decisions.push(decision);
        }

        info!(
            processed = decisions.len(),
            executed = decisions
                .iter()
                .filter(|d| d.outcome == ExecutionOutcome::Success)
                .count(),
            "Cycle complete"
        );
        Ok(decisions)
    }

    /// Apply the review label to a low-confidence message, best-effort.
    ///
    /// Organizational only: it runs outside the rate-limit quota and
    /// its failure never changes the recorded verdict.
    async fn flag_for_review(&self, email: &InboundEmail, verdict: &SafetyVerdict) {
        if verdict.reason != ReasonCode::BelowDraftThreshold || self.options.dry_run {
            return;
        }
        let Some(label) = self.options.review_label.clone() else {
            return;
        };

        let action = ActionKind::Label { name: label };
        if let Err(e) = self.executor.execute(&action, email, None).await {
            warn!(
                message_id = %email.message_id,
                error = %e,
                "Failed to apply review label"
            );
        }
    }
}

fn skip_detail(reason: ReasonCode) -> String {
    match reason {
        ReasonCode::BelowDraftThreshold => "confidence below draft threshold".into(),
        ReasonCode::RateLimited => "rate limit reached".into(),
        ReasonCode::Approved | ReasonCode::BelowAutoThreshold => "no action for this message".into(),
    }
}
