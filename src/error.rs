//! Error types for taskpilot.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the runner.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
///
/// Failures here are the only fatal class: a store that cannot be read or
/// written is an environment failure, not a task-level one.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Session pool errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session creation failed: {0}")]
    Create(String),

    #[error("Session pool acquire timed out after {timeout:?}")]
    AcquireTimeout { timeout: Duration },
}

/// Confirmation-mailbox errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox connection failed: {0}")]
    Connect(String),

    #[error("Mailbox login failed for {username}")]
    Login { username: String },

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-task failures, caught at the executor boundary and recorded on the
/// task record. One task's failure never aborts a concurrent batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("No identity available")]
    NoIdentityAvailable,

    #[error("No session available within {timeout:?}")]
    SessionUnavailable { timeout: Duration },

    #[error("Step {step} failed: {cause}")]
    StepFailed { step: String, cause: String },

    #[error("Confirmation code not received within {timeout:?}")]
    ConfirmationTimeout { timeout: Duration },

    #[error("Identity {handle} has exhausted its credits on the target")]
    QuotaExhausted { handle: String },

    #[error("Task {id} is in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Task {id} not found")]
    NotFound { id: Uuid },
}

/// Result type alias for the runner.
pub type Result<T> = std::result::Result<T, Error>;
