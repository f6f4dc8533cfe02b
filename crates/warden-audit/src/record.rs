// record.rs: Audit record data model and sealing.
//
// Every decision, emergency event, override and policy reload becomes one
// AuditRecord, one line in the JSONL audit log. Records form a chain:
// each record stores the `record_hash` of the record before it, and is
// signed over its canonical body, so deleting, reordering, or editing any
// record is detectable.
//
// The payload is an opaque JSON value: this crate does not know about
// decisions or emergency events, it only seals and verifies them.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuditError;
use crate::hasher;
use crate::signer::{SignatureVerifier, Signer};

/// What kind of fact a record holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A PolicyDecision produced by the validation gate.
    Decision,
    /// An EmergencyEvent (any SystemState transition).
    EmergencyEvent,
    /// An accepted administrative override.
    Override,
    /// A policy set was (re)loaded.
    PolicyReload,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Decision => write!(f, "decision"),
            RecordKind::EmergencyEvent => write!(f, "emergency_event"),
            RecordKind::Override => write!(f, "override"),
            RecordKind::PolicyReload => write!(f, "policy_reload"),
        }
    }
}

/// A single sealed audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    /// Position in the chain, starting at 0 (or at the retention anchor).
    pub sequence: u64,

    /// Unique identifier for this record.
    pub record_id: Uuid,

    /// When the record was sealed (UTC).
    pub timestamp: DateTime<Utc>,

    pub kind: RecordKind,

    /// The audited fact, e.g. a serialized PolicyDecision.
    pub payload: serde_json::Value,

    /// `record_hash` of the previous record; `None` only for the very first.
    pub previous_hash: Option<String>,

    /// SHA-256 over the canonical body (everything except this field and
    /// `signature`).
    pub record_hash: String,

    /// Base64 signature over the canonical body.
    pub signature: String,

    /// Which key signed the record.
    pub key_id: String,
}

/// The signed portion of a record. Field names must match `AuditRecord`.
#[derive(Serialize)]
struct RecordBody<'a> {
    sequence: u64,
    record_id: Uuid,
    timestamp: DateTime<Utc>,
    kind: RecordKind,
    payload: &'a serde_json::Value,
    previous_hash: &'a Option<String>,
    key_id: &'a str,
}

impl AuditRecord {
    /// Build, hash and sign a new record at the given chain position.
    pub fn seal<S: Signer + ?Sized>(
        sequence: u64,
        previous_hash: Option<String>,
        kind: RecordKind,
        payload: serde_json::Value,
        signer: &S,
    ) -> Result<Self, AuditError> {
        let mut record = Self {
            sequence,
            record_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            payload,
            previous_hash,
            record_hash: String::new(),
            signature: String::new(),
            key_id: signer.key_id().to_string(),
        };
        let body = record.body_json()?;
        record.record_hash = hasher::hash_str(&body);
        record.signature = signer.sign_b64(body.as_bytes());
        Ok(record)
    }

    /// Canonical encoding of the signed body.
    pub fn body_json(&self) -> Result<String, serde_json::Error> {
        hasher::canonical_json(&RecordBody {
            sequence: self.sequence,
            record_id: self.record_id,
            timestamp: self.timestamp,
            kind: self.kind,
            payload: &self.payload,
            previous_hash: &self.previous_hash,
            key_id: &self.key_id,
        })
    }

    /// Canonical encoding of the whole record: exactly one log line.
    pub fn canonical_line(&self) -> Result<String, serde_json::Error> {
        hasher::canonical_json(self)
    }

    /// Recompute the body hash.
    pub fn computed_hash(&self) -> Result<String, serde_json::Error> {
        Ok(hasher::hash_str(&self.body_json()?))
    }

    /// Check the signature against `verifier`.
    pub fn signature_valid<V: SignatureVerifier + ?Sized>(
        &self,
        verifier: &V,
    ) -> Result<bool, serde_json::Error> {
        let body = self.body_json()?;
        Ok(verifier.verify_b64(body.as_bytes(), &self.signature))
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Ed25519Signer;
    use serde_json::json;

    #[test]
    fn sealed_record_verifies() {
        let signer = Ed25519Signer::generate().unwrap();
        let record = AuditRecord::seal(
            0,
            None,
            RecordKind::Decision,
            json!({"allow": true, "risk_score": 0.1}),
            &signer,
        )
        .unwrap();

        assert_eq!(record.computed_hash().unwrap(), record.record_hash);
        assert!(record.signature_valid(&signer).unwrap());
        assert_eq!(record.key_id, signer.key_id());
    }

    #[test]
    fn edited_payload_fails_hash_and_signature() {
        let signer = Ed25519Signer::generate().unwrap();
        let mut record = AuditRecord::seal(
            3,
            Some("abc".into()),
            RecordKind::Override,
            json!({"admin_id": "ops"}),
            &signer,
        )
        .unwrap();
        record.payload = json!({"admin_id": "mallory"});

        assert_ne!(record.computed_hash().unwrap(), record.record_hash);
        assert!(!record.signature_valid(&signer).unwrap());
    }

    #[test]
    fn canonical_line_reparses_identically() {
        let signer = Ed25519Signer::generate().unwrap();
        let record = AuditRecord::seal(
            1,
            Some("prev".into()),
            RecordKind::EmergencyEvent,
            json!({"reason": "drill", "level": "high", "score": 0.35}),
            &signer,
        )
        .unwrap();
        let line = record.canonical_line().unwrap();
        let parsed: AuditRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.canonical_line().unwrap(), line);
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&RecordKind::EmergencyEvent).unwrap();
        assert_eq!(json, "\"emergency_event\"");
    }
}
