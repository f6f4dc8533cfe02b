// interpreter.rs: Local rule interpreter.
//
// Evaluates a merged PolicySet against a request and returns the same
// core/custom decision fragments an external evaluator returns. The gate
// uses it as the in-process backend, and as the fallback when the external
// backend is unavailable in `warn`/`allow` fail-safe modes.
//
// Fragment semantics: a fragment denies if any matching rule of its origin
// denies, and allows if any matching rule allows. Reasons list the deny
// reasons first; `matched` lists every rule that matched.

use serde::{Deserialize, Serialize};

use crate::bundle::{MatchContext, RuleEffect};
use crate::error::PolicyError;
use crate::request::EvaluationRequest;
use crate::risk::{RiskConfig, RiskScorer};
use crate::set::PolicySet;

/// Decision from one group of rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DecisionFragment {
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub deny: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    /// Qualified names of matching rules.
    #[serde(default)]
    pub matched: Vec<String>,
}

/// Backend response: core and custom fragments.
///
/// `core` is required. A response without it cannot be trusted to have
/// evaluated the non-negotiable rules, so it fails to parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResponse {
    pub core: DecisionFragment,
    #[serde(default)]
    pub custom: DecisionFragment,
}

impl EvaluationResponse {
    /// Every rule that matched, core first.
    pub fn evaluated_policies(&self) -> Vec<String> {
        self.core
            .matched
            .iter()
            .chain(self.custom.matched.iter())
            .cloned()
            .collect()
    }
}

/// In-process evaluator over a PolicySet.
#[derive(Debug, Clone)]
pub struct LocalInterpreter {
    scorer: RiskScorer,
}

impl LocalInterpreter {
    pub fn new(risk: RiskConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            scorer: RiskScorer::new(risk)?,
        })
    }

    pub fn with_scorer(scorer: RiskScorer) -> Self {
        Self { scorer }
    }

    pub fn evaluate(&self, set: &PolicySet, request: &EvaluationRequest) -> EvaluationResponse {
        let scan = self.scorer.detector().scan(request.content.as_deref());
        let risk = self.scorer.score(request);
        let ctx = MatchContext {
            request,
            scan: &scan,
            risk_score: risk.score,
        };

        let mut response = EvaluationResponse::default();
        let mut allow_reasons = (Vec::new(), Vec::new());

        for merged in set.rules.iter().filter(|r| r.rule.matches(&ctx)) {
            let (fragment, allows) = if merged.is_core {
                (&mut response.core, &mut allow_reasons.0)
            } else {
                (&mut response.custom, &mut allow_reasons.1)
            };
            fragment.matched.push(merged.qualified_name());
            let reason = if merged.rule.reason.is_empty() {
                merged.qualified_name()
            } else {
                merged.rule.reason.clone()
            };
            match merged.rule.effect {
                RuleEffect::Deny => {
                    fragment.deny = true;
                    fragment.reasons.push(reason);
                }
                RuleEffect::Allow => {
                    fragment.allow = true;
                    allows.push(reason);
                }
            }
        }

        response.core.reasons.extend(allow_reasons.0);
        response.custom.reasons.extend(allow_reasons.1);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CORE_BUNDLE;
    use crate::risk::Clock;
    use crate::source::{PolicyOrigin, PolicySource};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn set_with(custom: Option<&str>) -> PolicySet {
        let mut sources =
            vec![
                PolicySource::from_raw(PolicyOrigin::Core, "core", None, CORE_BUNDLE.into())
                    .unwrap(),
            ];
        if let Some(raw) = custom {
            sources.push(
                PolicySource::from_raw(PolicyOrigin::ProjectLocal, "local", None, raw.into())
                    .unwrap(),
            );
        }
        PolicySet::build(sources, vec![], 1).unwrap()
    }

    fn interp() -> LocalInterpreter {
        let scorer = RiskScorer::new(RiskConfig::default())
            .unwrap()
            .with_clock(Clock::Fixed(noon()));
        LocalInterpreter::with_scorer(scorer)
    }

    fn noon() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn self_replication_is_a_core_deny() {
        let custom = "namespace: team\nrules:\n  - {name: let_it_spawn, effect: allow, when: {actions: [create_agent]}}\n";
        let req = EvaluationRequest::new("create_agent", "agent", "planner");
        let res = interp().evaluate(&set_with(Some(custom)), &req);
        assert!(res.core.deny);
        assert!(res.core.reasons[0].contains("self-replication blocked"));
        assert!(res.custom.allow);
    }

    #[test]
    fn safe_read_allows_clean_low_risk_read() {
        let req = EvaluationRequest::new("read", "document", "planner");
        let res = interp().evaluate(&set_with(None), &req);
        assert!(res.core.allow);
        assert!(!res.core.deny);
        assert_eq!(res.core.matched, vec!["core.safe_read"]);
    }

    #[test]
    fn sensitive_content_blocks_safe_read() {
        let req = EvaluationRequest::new("read", "document", "planner")
            .with_content("ssn 123-45-6789");
        let res = interp().evaluate(&set_with(None), &req);
        assert!(!res.core.allow);
    }

    #[test]
    fn network_to_allowed_destination_is_not_blocked() {
        let set = set_with(None);
        let ok = EvaluationRequest::new("network_request", "api", "actor")
            .with_metadata("destination", json!("localhost"));
        let bad = EvaluationRequest::new("network_request", "api", "actor")
            .with_metadata("destination", json!("exfil.example"));
        assert!(!interp().evaluate(&set, &ok).core.deny);
        assert!(interp().evaluate(&set, &bad).core.deny);
    }

    #[test]
    fn human_operator_may_edit_policy() {
        let set = set_with(None);
        let agent = EvaluationRequest::new("write", "policy", "actor");
        let human = EvaluationRequest::new("write", "policy", "human_operator");
        assert!(interp().evaluate(&set, &agent).core.deny);
        assert!(!interp().evaluate(&set, &human).core.deny);
    }

    #[test]
    fn response_parses_without_reasons() {
        let res: EvaluationResponse = serde_json::from_value(json!({
            "core": {"allow": true, "deny": false},
            "custom": {"allow": false, "deny": false}
        }))
        .unwrap();
        assert!(res.core.allow);
        assert!(res.core.reasons.is_empty());
    }

    #[test]
    fn response_without_core_is_rejected() {
        let res = serde_json::from_value::<EvaluationResponse>(json!({
            "custom": {"allow": true, "deny": false}
        }));
        assert!(res.is_err());

        let res: EvaluationResponse =
            serde_json::from_value(json!({"core": {"deny": true}})).unwrap();
        assert!(res.core.deny);
        assert_eq!(res.custom, DecisionFragment::default());
    }
}
