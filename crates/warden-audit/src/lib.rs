//! # warden-audit
//!
//! Signed, hash-chained, append-only audit trail for Warden.
//!
//! Every policy decision, emergency transition, administrative override and
//! policy reload is recorded as an [`AuditRecord`] in a JSONL log. Each
//! record carries the hash of the record before it and an Ed25519
//! signature over its canonical body, so any edit, deletion or reordering is
//! reported by [`validate_integrity`] at the exact index where it happened.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use warden_audit::{AuditLog, Ed25519Signer, RecordKind};
//!
//! let signer = Ed25519Signer::load_or_generate("/tmp/keys/audit.pk8").unwrap();
//! let mut log = AuditLog::open("/tmp/audit.jsonl").unwrap();
//! log.append(RecordKind::Decision, serde_json::json!({"allow": false}), &signer)
//!     .unwrap();
//! let report = warden_audit::validate_integrity("/tmp/audit.jsonl", &signer).unwrap();
//! assert!(report.valid);
//! ```

pub mod error;
pub mod hasher;
pub mod log;
pub mod record;
pub mod retention;
pub mod signer;
pub mod writer;

pub use error::AuditError;
pub use log::{
    validate_integrity, AuditLog, BreakKind, ChainHead, IntegrityBreak, IntegrityReport,
};
pub use record::{AuditRecord, RecordKind};
pub use retention::{anchor_path, prune_before, ChainAnchor, PruneOutcome};
pub use signer::{
    key_id_for, public_key_path, Ed25519Signer, PublicKeyVerifier, SignatureVerifier, Signer,
};
pub use writer::{AuditTrail, TrailOptions};
