//! External collaborator interfaces — pure I/O, no business logic.
//!
//! The decision pipeline talks to the outside world through these two
//! narrow traits. Adapters handle transport; classification, gating,
//! and auditing live in `pipeline`.

pub mod email;

pub use email::{EmailChannel, EmailConfig};

use async_trait::async_trait;

use crate::error::{ExecutorError, MailboxError};
use crate::pipeline::types::{ActionKind, InboundEmail};

/// Inbound side of the mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetch up to `limit` unread messages without marking them read.
    ///
    /// Messages stay unread until the pipeline resolves them, so an
    /// aborted run retries them from scratch on the next poll.
    async fn fetch_unread(&self, limit: usize) -> Result<Vec<InboundEmail>, MailboxError>;

    /// Mark a message read so later polls skip it.
    async fn mark_read(&self, email: &InboundEmail) -> Result<(), MailboxError>;
}

/// Outbound side — carries out a gated final action.
///
/// No retries here: a failure is surfaced in the audit record and the
/// source message stays unresolved for the next run.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute an action against a message. `payload` carries the
    /// reply text for outbound (Reply/Draft) actions.
    async fn execute(
        &self,
        action: &ActionKind,
        email: &InboundEmail,
        payload: Option<&str>,
    ) -> Result<(), ExecutorError>;
}
