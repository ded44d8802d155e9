//! Durable rate-limit state.
//!
//! The state is a plain value type — a list of timestamped action
//! events — persisted as a small JSON file. It is loaded once at
//! process start and rewritten synchronously after every approved
//! action, so a crash never loses more than the in-flight decision.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StateStoreError;

/// Timestamped action events within the rolling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub events: Vec<DateTime<Utc>>,
}

impl RateLimitState {
    /// Count events within the trailing window, without mutating.
    ///
    /// An event exactly one window old has aged out.
    pub fn count_within(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - window;
        self.events.iter().filter(|ts| **ts > cutoff).count()
    }

    /// Drop events older than the window.
    pub fn prune(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = now - window;
        self.events.retain(|ts| *ts > cutoff);
    }

    /// Record a new approved action.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.events.push(now);
    }
}

/// File-backed store for [`RateLimitState`].
///
/// Writes go to a sibling temp file first and are renamed into place,
/// so a reader (or a crashed writer) never observes a torn file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted state. A missing file is a fresh start, not an
    /// error; an unreadable or corrupt file is an error the caller
    /// must treat as "fail closed".
    pub fn load(&self) -> Result<RateLimitState, StateStoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No rate-limit state file, starting empty");
                return Ok(RateLimitState::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&raw).map_err(|e| StateStoreError::Corrupt(e.to_string()))
    }

    /// Persist state atomically (write temp file, then rename).
    pub fn save(&self, state: &RateLimitState) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let raw = serde_json::to_string(state)
            .map_err(|e| StateStoreError::Corrupt(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
