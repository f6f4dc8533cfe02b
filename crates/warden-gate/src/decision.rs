// decision.rs: PolicyDecision and the rule that combines its inputs.
//
// `combine()` is pure: backend fragments, a risk assessment and an
// optional active override in, one decision out. The combination rules:
//
//   deny  = core.deny || custom.deny || no rule allowed || high risk
//   allow = !deny
//
// then overrides apply. A `deny` override always denies. An `allow`
// override lifts custom denials, the missing allow and a high risk score,
// but never a core deny.
//
// Every denial carries at least one reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_policy::{EvaluationRequest, EvaluationResponse, RiskAssessment};

use crate::emergency::SystemStateKind;
use crate::overrides::{OverrideDecision, OverrideRecord};

/// Resource types whose denials suggest human approval.
const CRITICAL_RESOURCES: &[&str] = &[
    "system_config",
    "policy",
    "agent_core",
    "credentials",
    "keys",
];

/// The gate's answer for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDecision {
    pub decision_id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub source_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    pub allow: bool,
    pub deny: bool,
    pub risk_score: f64,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub evaluated_policies: Vec<String>,
    #[serde(default)]
    pub remediation: Vec<String>,
    pub system_state: SystemStateKind,
    /// True when the decision came from a fail-safe path rather than policy.
    #[serde(default)]
    pub fail_safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_generation: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl PolicyDecision {
    fn blank(request: &EvaluationRequest, system_state: SystemStateKind) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            action: request.action.clone(),
            resource_type: request.resource_type.clone(),
            source_agent: request.source_agent.clone(),
            target_agent: request.target_agent.clone(),
            allow: false,
            deny: true,
            risk_score: 1.0,
            reasons: Vec::new(),
            evaluated_policies: Vec::new(),
            remediation: Vec::new(),
            system_state,
            fail_safe: false,
            override_id: None,
            policy_generation: None,
            timestamp: Utc::now(),
        }
    }

    /// Deny with maximum risk and a single reason. Used whenever the gate
    /// cannot reach a policy answer.
    pub fn fail_safe(
        request: &EvaluationRequest,
        reason: impl Into<String>,
        system_state: SystemStateKind,
    ) -> Self {
        let reason = reason.into();
        let remediation = match reason.as_str() {
            "evaluation_backend_timeout" | "evaluation_backend_error" => {
                vec!["Check evaluation backend availability".to_string()]
            }
            "core_policy_missing" | "internal_evaluation_error" => {
                vec!["Review policy configuration".to_string()]
            }
            _ => Vec::new(),
        };
        Self {
            reasons: vec![reason],
            remediation,
            fail_safe: true,
            ..Self::blank(request, system_state)
        }
    }

    /// Fast-path deny while the system is not NORMAL.
    pub fn state_deny(request: &EvaluationRequest, state: SystemStateKind) -> Self {
        Self {
            reasons: vec![state.deny_reason().to_string()],
            fail_safe: true,
            ..Self::blank(request, state)
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.policy_generation = Some(generation);
        self
    }
}

/// Combine backend fragments, risk and an active override into a decision.
pub fn combine(
    request: &EvaluationRequest,
    response: &EvaluationResponse,
    risk: &RiskAssessment,
    active_override: Option<&OverrideRecord>,
    system_state: SystemStateKind,
) -> PolicyDecision {
    let mut reasons = Vec::new();
    reasons.extend(response.core.reasons.iter().cloned());
    reasons.extend(response.custom.reasons.iter().cloned());

    let core_deny = response.core.deny;
    let mut deny = core_deny || response.custom.deny;

    if !response.core.allow && !response.custom.allow {
        deny = true;
        reasons.push("no_matching_allow_rule".to_string());
    }

    if risk.high_risk {
        deny = true;
        reasons.push("high_risk_score".to_string());
    }
    for factor in &risk.factors {
        reasons.push(format!("risk_factor:{}", factor));
    }

    let mut override_id = None;
    if let Some(record) = active_override {
        match record.request.override_decision {
            OverrideDecision::Deny => {
                deny = true;
                override_id = Some(record.override_id);
                reasons.push(format!("override_denied:{}", record.override_id));
            }
            OverrideDecision::Allow if core_deny => {
                reasons.push("override_ignored_core_deny".to_string());
            }
            OverrideDecision::Allow => {
                deny = false;
                override_id = Some(record.override_id);
                reasons.push(format!("override_applied:{}", record.override_id));
            }
        }
    }

    if deny && reasons.is_empty() {
        reasons.push("denied".to_string());
    }

    let risk_score = risk.score.clamp(0.0, 1.0);
    let remediation = if deny {
        remediation(request, risk_score)
    } else {
        Vec::new()
    };

    PolicyDecision {
        allow: !deny,
        deny,
        risk_score,
        reasons,
        evaluated_policies: response.evaluated_policies(),
        remediation,
        override_id,
        ..PolicyDecision::blank(request, system_state)
    }
}

/// Suggestions attached to a denial.
pub fn remediation(request: &EvaluationRequest, risk_score: f64) -> Vec<String> {
    let mut out = Vec::new();
    if matches!(request.action.as_str(), "write" | "delete" | "modify") {
        out.push("Consider using read-only operations instead".to_string());
        out.push("Request explicit approval for write operations".to_string());
    }
    if CRITICAL_RESOURCES.contains(&request.resource_type.as_str()) {
        out.push("Critical resource access requires human approval".to_string());
        out.push("Use staging environment for testing changes".to_string());
    }
    if risk_score > 0.8 {
        out.push("High-risk operation detected - manual review required".to_string());
        out.push("Consider breaking down into smaller, lower-risk operations".to_string());
    }
    if request
        .content
        .as_deref()
        .is_some_and(|c| c.to_ascii_lowercase().contains("api"))
    {
        out.push("Potential API key detected - review content for sensitive data".to_string());
    }
    out
}
