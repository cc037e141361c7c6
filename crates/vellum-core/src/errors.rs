//! Error taxonomy for the vellum engine.
//!
//! Constraint failures raised by the backend are classified in the storage
//! layer and re-raised as the typed variants below, so callers can match on
//! error kinds instead of parsing driver messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VellumError {
    /// Schema mismatch, invalid identifier or path, unknown field,
    /// wrong vector dimension.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unique constraint violated on field '{field}' for document '{id}'")]
    UniqueConstraint { field: String, id: String },

    #[error("document not found: {id}")]
    NotFound { id: String },

    #[error("version mismatch for '{id}': expected {expected}, actual {actual}")]
    VersionMismatch {
        id: String,
        expected: i64,
        actual: i64,
    },

    #[error("check constraint violated: {0}")]
    CheckConstraint(String),

    /// Driver, pool, and connection-lifecycle failures.
    #[error("database error: {0}")]
    Database(String),

    /// The database handle has been closed.
    #[error("database is closed")]
    Closed,

    /// Synchronous APIs are rejected on a shared (multiplexed) connection.
    #[error("synchronous operations are not available in shared-connection mode")]
    SharedSync,

    #[error("migration error: {0}")]
    Migration(String),

    #[error("plugin '{plugin}' failed in {hook}: {cause}")]
    Plugin {
        plugin: String,
        hook: String,
        cause: String,
    },

    #[error("plugin '{plugin}' timed out in {hook} after {timeout_ms} ms")]
    PluginTimeout {
        plugin: String,
        hook: String,
        timeout_ms: u64,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VellumError {
    /// Shorthand used throughout the validators.
    pub fn validation(msg: impl Into<String>) -> Self {
        VellumError::Validation(msg.into())
    }

    /// Whether a retry at the driver level may succeed (lock/busy/timeout).
    pub fn is_retriable(&self) -> bool {
        match self {
            VellumError::Database(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("busy") || msg.contains("locked") || msg.contains("timeout")
            }
            _ => false,
        }
    }
}

/// Convenience type alias.
pub type VellumResult<T> = Result<T, VellumError>;
