// gate.rs: The validation gate.
//
// Every agent action passes through `ValidationGate::evaluate()`:
//
//   1. state check: not NORMAL → fast-path deny, backend never called
//   2. policy snapshot: Arc clone of the active PolicySet
//   3. backend: core/custom fragments, bounded by a timeout
//   4. risk: contextual score from the request
//   5. combination: fragments + risk + active override → decision
//   6. audit: the decision is sealed into the audit chain
//
// Steps 2–5 run in their own task: an error or panic there becomes a
// fail-safe deny with `internal_evaluation_error`. The whole pipeline runs
// in an outer task that owns the audit write, so a caller that goes away
// mid-evaluation cannot leave a decision unrecorded.
//
// `evaluate()` only returns an error when the audit trail refuses the
// record (backpressure or a failed writer). Everything else is a decision.
// In `deny` fail-safe mode the decision record is synced to disk before the
// decision is returned.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use warden_audit::{AuditTrail, RecordKind};
use warden_policy::{
    EvaluationRequest, EvaluationResponse, LocalInterpreter, PolicySetSummary, PolicyStore,
    RiskScorer,
};

use crate::backend::EvaluationBackend;
use crate::config::FailSafeMode;
use crate::decision::{combine, PolicyDecision};
use crate::emergency::{EmergencyManager, SystemStateKind};
use crate::error::GateError;
use crate::overrides::{Fingerprint, OverrideHandler};
use crate::registry::DecisionRegistry;

/// Everything the gate is assembled from.
pub struct GateParts {
    pub store: Arc<PolicyStore>,
    pub backend: Arc<dyn EvaluationBackend>,
    pub fallback: LocalInterpreter,
    pub scorer: RiskScorer,
    pub emergency: Arc<EmergencyManager>,
    pub overrides: Arc<OverrideHandler>,
    pub registry: Arc<DecisionRegistry>,
    pub audit: AuditTrail,
    pub fail_safe: FailSafeMode,
    pub backend_timeout: Duration,
}

/// Decision for an ordered sequence of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDecision {
    pub allow: bool,
    pub deny: bool,
    /// Per-step decisions, up to and including the first denial.
    pub decisions: Vec<PolicyDecision>,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_at: Option<usize>,
    pub average_risk: f64,
    pub high_risk_steps: usize,
    pub requires_approval: bool,
    pub reasons: Vec<String>,
    pub remediation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateHealth {
    pub healthy: bool,
    pub system_state: SystemStateKind,
    pub backend: String,
    pub backend_healthy: bool,
    pub fail_safe: FailSafeMode,
    pub policy_generation: u64,
    pub core_loaded: bool,
    pub audit_next_sequence: u64,
}

struct GateInner {
    parts: GateParts,
}

/// Cheap-to-clone handle to the gate.
#[derive(Clone)]
pub struct ValidationGate {
    inner: Arc<GateInner>,
}

impl ValidationGate {
    pub fn new(parts: GateParts) -> Self {
        Self {
            inner: Arc::new(GateInner { parts }),
        }
    }

    /// Evaluate one request. See the module docs for the pipeline.
    pub async fn evaluate(&self, request: EvaluationRequest) -> Result<PolicyDecision, GateError> {
        let inner = Arc::clone(&self.inner);
        let fallback_request = request.clone();
        match tokio::spawn(async move { inner.evaluate_and_record(request).await }).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "evaluation task aborted");
                Ok(PolicyDecision::fail_safe(
                    &fallback_request,
                    "internal_evaluation_error",
                    self.inner.parts.emergency.kind(),
                ))
            }
        }
    }

    /// Evaluate steps in order, stopping at the first denial.
    pub async fn evaluate_workflow(
        &self,
        steps: Vec<EvaluationRequest>,
    ) -> Result<WorkflowDecision, GateError> {
        let total_steps = steps.len();
        if total_steps == 0 {
            return Ok(WorkflowDecision {
                allow: false,
                deny: true,
                decisions: Vec::new(),
                total_steps,
                denied_at: None,
                average_risk: 0.0,
                high_risk_steps: 0,
                requires_approval: false,
                reasons: vec!["empty_workflow".to_string()],
                remediation: Vec::new(),
            });
        }

        let threshold = self.inner.parts.scorer.config().high_risk_threshold;
        let mut decisions = Vec::with_capacity(total_steps);
        let mut denied_at = None;
        for (index, step) in steps.into_iter().enumerate() {
            let decision = self.evaluate(step).await?;
            let denied = decision.deny;
            decisions.push(decision);
            if denied {
                denied_at = Some(index);
                break;
            }
        }

        let average_risk =
            decisions.iter().map(|d| d.risk_score).sum::<f64>() / decisions.len() as f64;
        let high_risk_steps = decisions
            .iter()
            .filter(|d| d.risk_score >= threshold)
            .count();
        let requires_approval = high_risk_steps > 0;

        let mut reasons = Vec::new();
        let mut remediation = Vec::new();
        if let Some(index) = denied_at {
            reasons.push(format!("step_{}_denied", index));
            if let Some(denied) = decisions.last() {
                reasons.extend(denied.reasons.iter().cloned());
            }
            remediation.push("Remove or modify the blocked step to proceed".to_string());
            remediation.push("Contact an administrator for policy review".to_string());
        } else if requires_approval {
            reasons.push(format!("{}_high_risk_steps", high_risk_steps));
            remediation.push("Request human approval for high-risk workflow".to_string());
            remediation.push("Consider breaking the workflow into smaller steps".to_string());
        }

        Ok(WorkflowDecision {
            allow: denied_at.is_none(),
            deny: denied_at.is_some(),
            decisions,
            total_steps,
            denied_at,
            average_risk,
            high_risk_steps,
            requires_approval,
            reasons,
            remediation,
        })
    }

    pub async fn validate_agent_communication(
        &self,
        source_agent: &str,
        target_agent: &str,
        content: Option<String>,
    ) -> Result<PolicyDecision, GateError> {
        let mut request = EvaluationRequest::new("agent_communication", "agent", source_agent)
            .with_target(target_agent);
        request.content = content;
        self.evaluate(request).await
    }

    pub async fn validate_resource_access(
        &self,
        agent: &str,
        action: &str,
        resource_type: &str,
        content: Option<String>,
    ) -> Result<PolicyDecision, GateError> {
        let mut request = EvaluationRequest::new(action, resource_type, agent);
        request.content = content;
        self.evaluate(request).await
    }

    /// Reload every policy source and record the outcome.
    ///
    /// A failed reload keeps the previous set active and is still audited.
    pub async fn reload_policies(&self) -> Result<PolicySetSummary, GateError> {
        let store = Arc::clone(&self.inner.parts.store);
        let result = tokio::task::spawn_blocking(move || store.reload())
            .await
            .map_err(|e| GateError::Backend(format!("reload task failed: {}", e)))?;

        match result {
            Ok(set) => {
                let summary = set.summary();
                self.record_reload(serde_json::json!({
                    "status": "loaded",
                    "generation": summary.generation,
                    "fingerprint": summary.fingerprint,
                    "rule_count": summary.rule_count,
                    "skipped": summary.skipped,
                    "conflicts": summary.conflicts,
                }))
                .await?;
                Ok(summary)
            }
            Err(e) => {
                self.record_reload(serde_json::json!({
                    "status": "failed",
                    "error": e.to_string(),
                    "active_generation": self.inner.parts.store.snapshot().generation,
                }))
                .await?;
                Err(e.into())
            }
        }
    }

    pub async fn health(&self) -> GateHealth {
        let parts = &self.inner.parts;
        let set = parts.store.snapshot();
        let backend_healthy = parts.backend.health_check().await;
        let system_state = parts.emergency.kind();
        GateHealth {
            healthy: set.has_core() && system_state != SystemStateKind::Shutdown,
            system_state,
            backend: parts.backend.name().to_string(),
            backend_healthy,
            fail_safe: parts.fail_safe,
            policy_generation: set.generation,
            core_loaded: set.has_core(),
            audit_next_sequence: parts.audit.head().next_sequence,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.inner.parts.store
    }

    pub fn emergency(&self) -> &Arc<EmergencyManager> {
        &self.inner.parts.emergency
    }

    pub fn overrides(&self) -> &Arc<OverrideHandler> {
        &self.inner.parts.overrides
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.inner.parts.audit
    }

    async fn record_reload(&self, payload: serde_json::Value) -> Result<(), GateError> {
        self.inner
            .parts
            .audit
            .append(RecordKind::PolicyReload, payload)
            .await?;
        Ok(())
    }
}

impl GateInner {
    async fn evaluate_and_record(
        self: Arc<Self>,
        request: EvaluationRequest,
    ) -> Result<PolicyDecision, GateError> {
        let emergency = &self.parts.emergency;
        let mut state = emergency.kind();
        if state != SystemStateKind::Normal {
            if let Err(e) = emergency.refresh().await {
                tracing::warn!(error = %e, "state refresh failed");
            }
            state = emergency.kind();
        }

        let decision = if state == SystemStateKind::Normal {
            self.decide(request).await
        } else {
            PolicyDecision::state_deny(&request, state)
        };

        self.record(&decision).await?;
        Ok(decision)
    }

    /// Steps 2–5 in an isolated task.
    async fn decide(self: &Arc<Self>, request: EvaluationRequest) -> PolicyDecision {
        let inner = Arc::clone(self);
        let task_request = request.clone();
        let result = tokio::spawn(async move { inner.decide_inner(&task_request).await }).await;
        match result {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::error!(error = %e, action = %request.action, "evaluation failed; denying");
                PolicyDecision::fail_safe(&request, "internal_evaluation_error", SystemStateKind::Normal)
            }
            Err(e) => {
                tracing::error!(error = %e, action = %request.action, "evaluation task panicked; denying");
                PolicyDecision::fail_safe(&request, "internal_evaluation_error", SystemStateKind::Normal)
            }
        }
    }

    async fn decide_inner(&self, request: &EvaluationRequest) -> Result<PolicyDecision, GateError> {
        let parts = &self.parts;
        let set = parts.store.snapshot();
        if !set.has_core() {
            tracing::error!(generation = set.generation, "no core policy loaded; denying");
            return Ok(PolicyDecision::fail_safe(
                request,
                "core_policy_missing",
                SystemStateKind::Normal,
            )
            .with_generation(set.generation));
        }

        let outcome =
            tokio::time::timeout(parts.backend_timeout, parts.backend.evaluate(&set, request)).await;
        let answer: Result<EvaluationResponse, (&str, String)> = match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(GateError::BackendTimeout { .. })) | Err(_) => Err((
                "evaluation_backend_timeout",
                format!("no answer within {} ms", parts.backend_timeout.as_millis()),
            )),
            Ok(Err(e)) => Err(("evaluation_backend_error", e.to_string())),
        };
        let (response, fallback_note) = match answer {
            Ok(response) => (response, None),
            Err((reason, detail)) => {
                match parts.fail_safe {
                    FailSafeMode::Deny => {
                        tracing::error!(
                            backend = parts.backend.name(),
                            reason,
                            detail = %detail,
                            "evaluation backend failed; fail-safe deny"
                        );
                        return Ok(PolicyDecision::fail_safe(
                            request,
                            reason,
                            SystemStateKind::Normal,
                        )
                        .with_generation(set.generation));
                    }
                    FailSafeMode::Warn | FailSafeMode::Allow => {
                        tracing::warn!(
                            backend = parts.backend.name(),
                            reason,
                            detail = %detail,
                            mode = %parts.fail_safe,
                            "evaluation backend failed; using local interpreter"
                        );
                        (
                            parts.fallback.evaluate(&set, request),
                            Some(format!("{}:local_fallback", reason)),
                        )
                    }
                }
            }
        };

        let risk = parts.scorer.score(request);
        let active = parts
            .overrides
            .active_for(&Fingerprint::of_request(request), Utc::now());
        let mut decision = combine(
            request,
            &response,
            &risk,
            active.as_ref(),
            SystemStateKind::Normal,
        )
        .with_generation(set.generation);
        if let Some(note) = fallback_note {
            decision.reasons.push(note);
        }

        if decision.deny {
            tracing::warn!(
                decision_id = %decision.decision_id,
                action = %decision.action,
                resource_type = %decision.resource_type,
                source_agent = %decision.source_agent,
                risk = decision.risk_score,
                reasons = ?decision.reasons,
                "request denied"
            );
        } else {
            tracing::debug!(
                decision_id = %decision.decision_id,
                action = %decision.action,
                risk = decision.risk_score,
                "request allowed"
            );
        }
        Ok(decision)
    }

    async fn record(&self, decision: &PolicyDecision) -> Result<(), GateError> {
        let payload = serde_json::to_value(decision)
            .map_err(|e| GateError::Backend(format!("decision not serializable: {}", e)))?;
        let audit = &self.parts.audit;
        match self.parts.fail_safe {
            FailSafeMode::Deny => audit.append_durable(RecordKind::Decision, payload).await?,
            FailSafeMode::Warn | FailSafeMode::Allow => {
                audit.append(RecordKind::Decision, payload).await?
            }
        };
        self.parts.registry.insert(decision);
        Ok(())
    }
}
