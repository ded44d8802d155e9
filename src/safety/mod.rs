//! Safety layer — confidence gating and rate limiting.
//!
//! This is the only deterministic, auditable checkpoint between a
//! probabilistic classifier and an irreversible external action, and
//! the only component authorized to downgrade or block an action. It
//! has no access to classifier internals: the verdict is a function of
//! the candidate, the durable rate-limit state, and the clock.
//!
//! Gates apply in strict order and can only downgrade:
//! 1. Reply below the auto-send threshold → Draft.
//! 2. Anything still actionable below the draft threshold → NoOp
//!    (flagged for human review by the pipeline).
//! 3. Rolling-window rate limit → NoOp, regardless of confidence.
//!
//! If the state store cannot be read or written the layer fails
//! closed: the rate limit is treated as exhausted rather than risking
//! an unmetered auto-send.

pub mod state;

pub use state::{FileStateStore, RateLimitState};

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::{RateLimitConfig, SafetyConfig};
use crate::pipeline::types::{ActionCandidate, ActionKind, ReasonCode, SafetyVerdict};

/// Confidence and rate-limit gate over candidate actions.
pub struct SafetyLayer {
    auto_threshold: f64,
    draft_threshold: f64,
    limit: RateLimitConfig,
    store: FileStateStore,
    /// `None` means the store was unreadable at startup — every gate
    /// fails closed until the process restarts with a healthy store.
    state: Mutex<Option<RateLimitState>>,
}

impl SafetyLayer {
    /// Load durable state and build the layer.
    ///
    /// A missing state file starts empty; an unreadable one puts the
    /// layer into fail-closed mode (warned once here).
    pub fn open(config: &SafetyConfig, store: FileStateStore) -> Self {
        let state = match store.load() {
            Ok(state) => {
                debug!(
                    events = state.events.len(),
                    path = %store.path().display(),
                    "Loaded rate-limit state"
                );
                Some(state)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %store.path().display(),
                    "Rate-limit state unreadable — failing closed for this run"
                );
                None
            }
        };

        Self {
            auto_threshold: config.min_confidence_for_auto_action,
            draft_threshold: config.min_confidence_for_draft,
            limit: config.rate_limit.clone(),
            store,
            state: Mutex::new(state),
        }
    }

    fn window(&self) -> Duration {
        Duration::minutes(self.limit.window_minutes)
    }

    fn fail_closed() -> SafetyVerdict {
        SafetyVerdict {
            final_action: ActionKind::NoOp,
            reason: ReasonCode::RateLimited,
            rate_limit_remaining: 0,
        }
    }

    /// Pure gate evaluation — no state commit, no I/O.
    ///
    /// Deterministic for fixed `(candidate, state, now)`: re-gating the
    /// same triple without committing yields an identical verdict.
    pub fn evaluate(
        &self,
        candidate: &ActionCandidate,
        state: &RateLimitState,
        now: DateTime<Utc>,
    ) -> SafetyVerdict {
        let mut action = candidate.action.clone();
        let mut reason = ReasonCode::Approved;

        if action == ActionKind::Reply && candidate.confidence < self.auto_threshold {
            action = ActionKind::Draft;
            reason = ReasonCode::BelowAutoThreshold;
        }

        if action.is_actionable() && candidate.confidence < self.draft_threshold {
            action = ActionKind::NoOp;
            reason = ReasonCode::BelowDraftThreshold;
        }

        let used = state.count_within(self.window(), now) as u32;
        let remaining = self.limit.max_actions.saturating_sub(used);

        if self.limit.enabled && action.is_actionable() && remaining == 0 {
            return Self::fail_closed();
        }

        let rate_limit_remaining = if action.is_actionable() {
            remaining.saturating_sub(1)
        } else {
            remaining
        };

        SafetyVerdict {
            final_action: action,
            reason,
            rate_limit_remaining,
        }
    }

    /// Gate a candidate and, on an actionable verdict, consume quota.
    ///
    /// The read-modify-write of the rate-limit state is a single
    /// critical section — concurrent gates cannot jointly exceed the
    /// ceiling. State is persisted before returning, and a persist
    /// failure blocks the action (fail closed) and rolls the in-memory
    /// event back so memory and disk stay consistent.
    pub fn gate(&self, candidate: &ActionCandidate, now: DateTime<Utc>) -> SafetyVerdict {
        let mut guard = self.state.lock().expect("safety state mutex poisoned");
        let Some(state) = guard.as_mut() else {
            warn!(
                rule = %candidate.rule_id,
                "Rate-limit state unavailable, failing closed"
            );
            return Self::fail_closed();
        };

        let verdict = self.evaluate(candidate, state, now);

        if verdict.final_action.is_actionable() {
            state.prune(self.window(), now);
            state.record(now);
            if let Err(e) = self.store.save(state) {
                state.events.pop();
                warn!(error = %e, "Failed to persist rate-limit state, failing closed");
                return Self::fail_closed();
            }
        }

        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safety_config() -> SafetyConfig {
        SafetyConfig::default()
    }

    fn layer_in(dir: &tempfile::TempDir) -> SafetyLayer {
        let store = FileStateStore::new(dir.path().join("safety_state.json"));
        SafetyLayer::open(&safety_config(), store)
    }

    fn candidate(action: ActionKind, confidence: f64) -> ActionCandidate {
        ActionCandidate {
            action,
            rule_id: "test-rule".into(),
            confidence,
        }
    }

    #[test]
    fn high_confidence_reply_is_approved() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.92), Utc::now());
        assert_eq!(verdict.final_action, ActionKind::Reply);
        assert_eq!(verdict.reason, ReasonCode::Approved);
        assert_eq!(verdict.rate_limit_remaining, 49);
    }

    #[test]
    fn medium_confidence_reply_downgrades_to_draft() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.70), Utc::now());
        assert_eq!(verdict.final_action, ActionKind::Draft);
        assert_eq!(verdict.reason, ReasonCode::BelowAutoThreshold);
    }

    #[test]
    fn low_confidence_suppresses_every_action_kind() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);
        for action in [
            ActionKind::Reply,
            ActionKind::Draft,
            ActionKind::Label {
                name: "x".into(),
            },
            ActionKind::Archive,
        ] {
            let verdict = layer.gate(&candidate(action, 0.40), Utc::now());
            assert_eq!(verdict.final_action, ActionKind::NoOp);
            assert_eq!(verdict.reason, ReasonCode::BelowDraftThreshold);
        }
    }

    #[test]
    fn threshold_boundaries_are_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);

        // Exactly at the auto threshold → still auto.
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.85), Utc::now());
        assert_eq!(verdict.final_action, ActionKind::Reply);

        // Exactly at the draft threshold → still drafts.
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.60), Utc::now());
        assert_eq!(verdict.final_action, ActionKind::Draft);
    }

    #[test]
    fn draft_candidate_above_draft_threshold_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);
        let verdict = layer.gate(&candidate(ActionKind::Draft, 0.70), Utc::now());
        assert_eq!(verdict.final_action, ActionKind::Draft);
        assert_eq!(verdict.reason, ReasonCode::Approved);
    }

    #[test]
    fn archive_is_not_confidence_gated_for_auto_send() {
        // Archive is not an auto-send action; the 0.85 gate is Reply-only.
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);
        let verdict = layer.gate(&candidate(ActionKind::Archive, 0.70), Utc::now());
        assert_eq!(verdict.final_action, ActionKind::Archive);
        assert_eq!(verdict.reason, ReasonCode::Approved);
    }

    #[test]
    fn noop_candidate_passes_through_without_consuming_quota() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);
        let verdict = layer.gate(&candidate(ActionKind::NoOp, 0.99), Utc::now());
        assert_eq!(verdict.final_action, ActionKind::NoOp);
        assert_eq!(verdict.reason, ReasonCode::Approved);
        assert_eq!(verdict.rate_limit_remaining, 50);

        // Nothing was persisted — no state file yet.
        let store = FileStateStore::new(dir.path().join("safety_state.json"));
        assert!(store.load().unwrap().events.is_empty());
    }

    #[test]
    fn capacity_blocks_even_max_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("safety_state.json"));

        let now = Utc::now();
        let mut state = RateLimitState::default();
        for i in 0..50 {
            state.record(now - Duration::seconds(i));
        }
        store.save(&state).unwrap();

        let layer = SafetyLayer::open(&safety_config(), store);
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.99), now);
        assert_eq!(verdict.final_action, ActionKind::NoOp);
        assert_eq!(verdict.reason, ReasonCode::RateLimited);
        assert_eq!(verdict.rate_limit_remaining, 0);
    }

    #[test]
    fn events_outside_window_free_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("safety_state.json"));

        let now = Utc::now();
        let mut state = RateLimitState::default();
        for _ in 0..50 {
            state.record(now - Duration::minutes(61));
        }
        store.save(&state).unwrap();

        let layer = SafetyLayer::open(&safety_config(), store);
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.99), now);
        assert_eq!(verdict.final_action, ActionKind::Reply);
        assert_eq!(verdict.reason, ReasonCode::Approved);
    }

    #[test]
    fn confidence_gates_run_before_rate_limit() {
        // A below-draft candidate at capacity reports the confidence
        // reason — it never reaches the rate-limit check.
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("safety_state.json"));

        let now = Utc::now();
        let mut state = RateLimitState::default();
        for _ in 0..50 {
            state.record(now);
        }
        store.save(&state).unwrap();

        let layer = SafetyLayer::open(&safety_config(), store);
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.40), now);
        assert_eq!(verdict.reason, ReasonCode::BelowDraftThreshold);
    }

    #[test]
    fn approval_consumes_quota_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);

        let now = Utc::now();
        layer.gate(&candidate(ActionKind::Reply, 0.9), now);
        layer.gate(&candidate(ActionKind::Archive, 0.9), now);

        let store = FileStateStore::new(dir.path().join("safety_state.json"));
        let persisted = store.load().unwrap();
        assert_eq!(persisted.count_within(Duration::minutes(60), now), 2);
    }

    #[test]
    fn sequential_gates_exhaust_the_ceiling_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);
        let now = Utc::now();

        for i in 0..50 {
            let verdict = layer.gate(&candidate(ActionKind::Reply, 0.9), now);
            assert_eq!(verdict.final_action, ActionKind::Reply, "approval {i}");
        }
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.9), now);
        assert_eq!(verdict.reason, ReasonCode::RateLimited);
    }

    #[test]
    fn restart_preserves_the_count() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let layer = layer_in(&dir);
            for _ in 0..50 {
                layer.gate(&candidate(ActionKind::Reply, 0.9), now);
            }
        }

        // New process, same store.
        let layer = layer_in(&dir);
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.99), now);
        assert_eq!(verdict.reason, ReasonCode::RateLimited);
    }

    #[test]
    fn evaluate_is_idempotent_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        let layer = layer_in(&dir);

        let now = Utc::now();
        let state = RateLimitState {
            events: vec![now - Duration::minutes(5); 10],
        };
        let c = candidate(ActionKind::Reply, 0.92);

        let first = layer.evaluate(&c, &state, now);
        let second = layer.evaluate(&c, &state, now);
        assert_eq!(first, second);
        assert_eq!(first.rate_limit_remaining, 39);
    }

    #[test]
    fn unreadable_store_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        // The store path is a directory — reading it fails.
        let store = FileStateStore::new(dir.path());
        let layer = SafetyLayer::open(&safety_config(), store);

        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.99), Utc::now());
        assert_eq!(verdict.final_action, ActionKind::NoOp);
        assert_eq!(verdict.reason, ReasonCode::RateLimited);
    }

    #[test]
    fn unwritable_store_fails_closed_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("state");
        std::fs::create_dir(&parent).unwrap();
        let store = FileStateStore::new(parent.join("safety_state.json"));
        let layer = SafetyLayer::open(&safety_config(), store);

        // Replace the parent directory with a regular file so the
        // persist step cannot succeed.
        std::fs::remove_dir_all(&parent).unwrap();
        std::fs::write(&parent, "").unwrap();

        let now = Utc::now();
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.99), now);
        assert_eq!(verdict.reason, ReasonCode::RateLimited);

        // The rolled-back event must not count against later gates.
        std::fs::remove_file(&parent).unwrap();
        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.99), now);
        assert_eq!(verdict.final_action, ActionKind::Reply);
        assert_eq!(verdict.rate_limit_remaining, 49);
    }

    #[test]
    fn disabled_limiter_skips_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("safety_state.json"));

        let now = Utc::now();
        let mut state = RateLimitState::default();
        for _ in 0..50 {
            state.record(now);
        }
        store.save(&state).unwrap();

        let mut config = safety_config();
        config.rate_limit.enabled = false;
        let layer = SafetyLayer::open(&config, store);

        let verdict = layer.gate(&candidate(ActionKind::Reply, 0.99), now);
        assert_eq!(verdict.final_action, ActionKind::Reply);
        assert_eq!(verdict.reason, ReasonCode::Approved);
    }
}
