// error.rs: Error types for the audit subsystem.
//
// Uses `thiserror` to derive the standard Rust `Error` trait automatically.
// Each variant maps to a specific failure mode in the audit pipeline.
// Chain breaks found during validation are NOT errors here: they are data,
// reported through `IntegrityReport` so callers always get the break index.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to open or create the audit log file.
    #[error("failed to open audit log at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a record to the log.
    #[error("failed to append record: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// Failed to serialize or deserialize a record (malformed JSON).
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The signing key could not be loaded, generated, or persisted.
    #[error("signing key unavailable at {path}: {reason}")]
    SigningKey { path: PathBuf, reason: String },

    /// The existing log tail could not be recovered, so new records cannot
    /// be chained onto it.
    #[error("cannot recover chain state from {path}: {reason}")]
    ChainRecovery { path: PathBuf, reason: String },

    /// The bounded write queue stayed full for the whole backpressure window.
    /// Retryable: nothing was sealed or written.
    #[error("audit queue saturated; retry later")]
    Backpressure,

    /// The background writer has stopped (earlier write failure or shutdown).
    #[error("audit writer unavailable: {0}")]
    WriterUnavailable(String),
}

impl AuditError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuditError::Backpressure)
    }
}
