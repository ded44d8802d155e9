//! Error types for Inbox Agent.

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Configuration-related errors. All of these are fatal at startup —
/// none is ever surfaced per-message.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Rule {rule}: unknown intent '{value}'")]
    UnknownIntent { rule: String, value: String },

    #[error("Rule {rule}: unknown priority '{value}'")]
    UnknownPriority { rule: String, value: String },

    #[error("Rule {rule}: unknown action type '{value}'")]
    UnknownAction { rule: String, value: String },

    #[error("Rule {rule}: action '{value}' requires a value")]
    MissingActionValue { rule: String, value: String },

    #[error("Rules {first} and {second} have the same matcher and order")]
    DuplicateRule { first: String, second: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification service errors.
///
/// The pipeline recovers from all of these by substituting a
/// zero-confidence Unknown result — they never crash a run.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    Request(String),

    #[error("Classifier returned an empty response")]
    EmptyResponse,

    #[error("Classifier returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Mailbox (inbound side) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Mailbox authentication failed: {0}")]
    Auth(String),

    #[error("Failed to fetch messages: {0}")]
    Fetch(String),

    #[error("Failed to mark message {id} as read: {reason}")]
    MarkRead { id: String, reason: String },
}

/// Action executor errors. Surfaced in the audit record as a Failed
/// outcome; the source message is left unresolved for the next run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to send reply to {to}: {reason}")]
    Send { to: String, reason: String },

    #[error("Failed to save draft: {0}")]
    Draft(String),

    #[error("Failed to apply label {label}: {reason}")]
    Label { label: String, reason: String },

    #[error("Failed to archive message {id}: {reason}")]
    Archive { id: String, reason: String },

    #[error("Unsupported action: {0}")]
    Unsupported(String),
}

/// Rate-limit state persistence errors. The safety layer fails closed
/// on any of these — a gate with unreadable state returns RateLimited.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt state file: {0}")]
    Corrupt(String),
}

/// Audit log errors. Never propagated into the pipeline — failures are
/// reported on the tracing fallback channel instead.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
