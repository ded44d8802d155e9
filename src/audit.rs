//! Append-only audit log.
//!
//! One self-contained JSON record per line, flushed per record, so a
//! second process can tail the file while it grows without ever seeing
//! a partial record. Records are never rewritten in place.
//!
//! Logging failures never fail the pipeline: a record that cannot be
//! written is reported on the tracing error channel (the secondary
//! fallback) and the already-taken action stands.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{error, info};

use crate::error::AuditError;
use crate::pipeline::types::AuditRecord;

/// Append-only JSONL audit log.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the audit log for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "Audit log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Where records are appended.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Never fails the caller.
    pub fn record(&self, record: &AuditRecord) {
        if let Err(e) = self.try_record(record) {
            error!(
                error = %e,
                message_id = %record.message_id,
                outcome = record.outcome.label(),
                "Failed to write audit record"
            );
        }
    }

    fn try_record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| AuditError::Serialize(e.to_string()))?;
        line.push('\n');

        // Single write + flush keeps each record atomic for tailers.
        let mut file = self.file.lock().expect("audit log mutex poisoned");
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read every record in an audit log file.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record =
                serde_json::from_str(&line).map_err(|e| AuditError::Serialize(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}
