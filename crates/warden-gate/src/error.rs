// error.rs: Error types for the gate.
//
// Evaluation itself never fails with these: backend problems are turned
// into fail-safe deny decisions before they reach a caller. `GateError`
// surfaces from the administrative paths (transitions, overrides), from
// startup, and from evaluation only when the audit trail cannot take the
// record.

use std::path::PathBuf;
use thiserror::Error;

use crate::emergency::SystemStateKind;

/// Errors that can occur during gate operations.
#[derive(Debug, Error)]
pub enum GateError {
    /// The evaluation backend did not answer within the configured bound.
    #[error("evaluation backend timed out after {timeout_ms} ms")]
    BackendTimeout { timeout_ms: u64 },

    /// The evaluation backend failed or returned an unusable answer.
    #[error("evaluation backend error: {0}")]
    Backend(String),

    /// The requested transition is not allowed from the current state.
    #[error("invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: SystemStateKind,
        to: SystemStateKind,
        reason: String,
    },

    /// An override request was rejected.
    #[error("override rejected: {0}")]
    OverrideApproval(String),

    /// The last persisted state is SHUTDOWN and the operator has not
    /// acknowledged it.
    #[error("system was shut down at {at} ({reason}); restart requires explicit acknowledgement")]
    ShutdownPersisted { at: String, reason: String },

    /// The audit trail could not take a record.
    #[error("audit error: {0}")]
    Audit(#[from] warden_audit::AuditError),

    /// Policy loading failed.
    #[error("policy error: {0}")]
    Policy(#[from] warden_policy::PolicyError),

    /// Configuration could not be read or parsed.
    #[error("invalid configuration in {source_name}: {reason}")]
    Config {
        source_name: String,
        reason: String,
    },

    /// A file needed at startup could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl GateError {
    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::Audit(e) if e.is_retryable())
    }
}
