// error.rs: Error types for the policy subsystem.
//
// Only two of these are ever fatal: `CoreIntegrity` (the core bundle could
// not be validated or regenerated) and `NoCoreSource` (a set was about to be
// built without core rules). Everything else describes a single source and
// leads to that source being skipped.

use std::path::PathBuf;
use thiserror::Error;

use crate::source::PolicyOrigin;

/// Errors that can occur during policy operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A non-core bundle failed to load, parse, or verify.
    #[error("policy source {origin} at {location} rejected: {reason}")]
    Source {
        origin: PolicyOrigin,
        location: String,
        reason: String,
    },

    /// The core bundle is corrupt and could not be regenerated.
    #[error("core policy bundle at {path} failed integrity check: {reason}")]
    CoreIntegrity { path: PathBuf, reason: String },

    /// A policy set was constructed without any valid core source.
    #[error("refusing to build a policy set without core rules")]
    NoCoreSource,

    /// A policy directory could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A content-detection pattern failed to compile.
    #[error("invalid detection pattern: {0}")]
    Pattern(#[from] regex::Error),
}
