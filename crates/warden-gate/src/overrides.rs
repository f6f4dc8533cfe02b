// overrides.rs: Administrative overrides.
//
// An override is a human decision that pre-empts policy for one request
// fingerprint `(action, resource_type, source_agent)` until `valid_until`.
// It must name an existing decision, carry a non-empty approval chain, and
// cannot be submitted once the system has shut down.
//
// Accepted overrides are durably written to the audit trail before they
// take effect. Expired overrides are dropped the next time they are looked
// at; nothing renews them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_audit::{AuditRecord, AuditTrail, RecordKind};
use warden_policy::EvaluationRequest;

use crate::decision::PolicyDecision;
use crate::emergency::{EmergencyManager, SystemStateKind};
use crate::error::GateError;
use crate::registry::DecisionRegistry;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverrideRequest {
    pub admin_id: String,
    pub justification: String,
    pub approval_chain: Vec<String>,
    pub original_decision_id: Uuid,
    pub override_decision: OverrideDecision,
    pub valid_until: DateTime<Utc>,
}

/// The request shape an override applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub action: String,
    pub resource_type: String,
    pub source_agent: String,
}

impl Fingerprint {
    pub fn of(decision: &PolicyDecision) -> Self {
        Self {
            action: decision.action.clone(),
            resource_type: decision.resource_type.clone(),
            source_agent: decision.source_agent.clone(),
        }
    }

    pub fn of_request(request: &EvaluationRequest) -> Self {
        Self {
            action: request.action.clone(),
            resource_type: request.resource_type.clone(),
            source_agent: request.source_agent.clone(),
        }
    }
}

/// An accepted override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverrideRecord {
    pub override_id: Uuid,
    pub request: OverrideRequest,
    pub fingerprint: Fingerprint,
    pub accepted_at: DateTime<Utc>,
}

impl OverrideRecord {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.request.valid_until > now
    }
}

/// Validates, persists and serves overrides.
pub struct OverrideHandler {
    audit: AuditTrail,
    emergency: Arc<EmergencyManager>,
    registry: Arc<DecisionRegistry>,
    active: Mutex<HashMap<Fingerprint, OverrideRecord>>,
}

impl OverrideHandler {
    pub fn new(
        audit: AuditTrail,
        emergency: Arc<EmergencyManager>,
        registry: Arc<DecisionRegistry>,
    ) -> Self {
        Self {
            audit,
            emergency,
            registry,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and accept an override.
    pub async fn submit(&self, request: OverrideRequest) -> Result<OverrideRecord, GateError> {
        if request.admin_id.trim().is_empty() {
            return Err(GateError::OverrideApproval("admin_id is required".into()));
        }
        if request.approval_chain.is_empty() {
            return Err(GateError::OverrideApproval(
                "approval_chain must not be empty".into(),
            ));
        }
        if request.approval_chain.iter().any(|a| a.trim().is_empty()) {
            return Err(GateError::OverrideApproval(
                "approval_chain contains a blank entry".into(),
            ));
        }
        let now = Utc::now();
        if request.valid_until <= now {
            return Err(GateError::OverrideApproval(format!(
                "valid_until {} is not in the future",
                request.valid_until.to_rfc3339()
            )));
        }
        let state = self.emergency.kind();
        if state == SystemStateKind::Shutdown {
            return Err(GateError::InvalidStateTransition {
                from: state,
                to: state,
                reason: "overrides are not accepted after shutdown".into(),
            });
        }

        let fingerprint = self.lookup(request.original_decision_id).await?;

        let record = OverrideRecord {
            override_id: Uuid::new_v4(),
            request,
            fingerprint,
            accepted_at: now,
        };
        let payload =
            serde_json::to_value(&record).map_err(|e| GateError::Backend(e.to_string()))?;
        self.audit
            .append_durable(RecordKind::Override, payload)
            .await?;

        tracing::warn!(
            override_id = %record.override_id,
            admin = %record.request.admin_id,
            decision = ?record.request.override_decision,
            action = %record.fingerprint.action,
            resource_type = %record.fingerprint.resource_type,
            source_agent = %record.fingerprint.source_agent,
            valid_until = %record.request.valid_until,
            "administrative override accepted"
        );

        self.insert(record.clone());
        Ok(record)
    }

    /// The override currently covering `fingerprint`, if any.
    pub fn active_for(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Option<OverrideRecord> {
        let mut active = self.lock();
        match active.get(fingerprint) {
            Some(record) if record.is_active_at(now) => Some(record.clone()),
            Some(_) => {
                active.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    /// Every unexpired override.
    pub fn active(&self) -> Vec<OverrideRecord> {
        let now = Utc::now();
        let mut active = self.lock();
        active.retain(|_, r| r.is_active_at(now));
        let mut out: Vec<_> = active.values().cloned().collect();
        out.sort_by_key(|r| r.accepted_at);
        out
    }

    /// Reinstate unexpired overrides found in the audit log.
    pub fn restore(&self, records: &[AuditRecord]) -> usize {
        let now = Utc::now();
        let mut restored = 0;
        for record in records.iter().filter(|r| r.kind == RecordKind::Override) {
            match record.payload_as::<OverrideRecord>() {
                Ok(ov) if ov.is_active_at(now) => {
                    self.insert(ov);
                    restored += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(sequence = record.sequence, error = %e, "unreadable override in audit log");
                }
            }
        }
        restored
    }

    async fn lookup(&self, decision_id: Uuid) -> Result<Fingerprint, GateError> {
        if let Some(fp) = self.registry.get(&decision_id) {
            return Ok(fp);
        }
        let record = self.audit.find_decision(decision_id).await?;
        match record.map(|r| r.payload_as::<PolicyDecision>()) {
            Some(Ok(decision)) => Ok(Fingerprint::of(&decision)),
            Some(Err(e)) => Err(GateError::OverrideApproval(format!(
                "decision {} is unreadable: {}",
                decision_id, e
            ))),
            None => Err(GateError::OverrideApproval(format!(
                "unknown decision {}",
                decision_id
            ))),
        }
    }

    fn insert(&self, record: OverrideRecord) {
        self.lock().insert(record.fingerprint.clone(), record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, OverrideRecord>> {
        match self.active.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
