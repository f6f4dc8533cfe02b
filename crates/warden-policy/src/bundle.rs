// bundle.rs: Policy bundle format and rule matching.
//
// A bundle is a YAML document with a namespace and a list of rules:
//
//   namespace: custom.team
//   version: "1.0.0"
//   rules:
//     - name: allow_reports
//       effect: allow
//       reason: "reports are readable"
//       when:
//         actions: [read]
//         resource_types: [report]
//
// Every list inside `when` is a filter: an empty list matches anything.
// A rule matches a request only when *all* of its filters match.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::content::ContentScan;
use crate::request::EvaluationRequest;

/// Whether a matching rule allows or denies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    Allow,
    Deny,
}

/// Conditions under which a rule applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleCondition {
    pub actions: Vec<String>,
    pub resource_types: Vec<String>,
    pub source_agents: Vec<String>,
    /// Agents this rule never applies to.
    pub except_agents: Vec<String>,
    /// When non-empty, the request must name one of these targets.
    pub target_agents: Vec<String>,
    /// Only match when the content has no sensitive or malicious findings.
    pub content_clean: bool,
    /// The rule does not apply when `metadata[key]` is one of the values.
    pub unless_metadata: BTreeMap<String, Vec<String>>,
    /// Only match when the request's risk score is below this bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_risk: Option<f64>,
}

/// One named rule inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub name: String,
    pub effect: RuleEffect,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub when: RuleCondition,
}

/// What a rule is evaluated against.
pub struct MatchContext<'a> {
    pub request: &'a EvaluationRequest,
    pub scan: &'a ContentScan,
    pub risk_score: f64,
}

fn listed(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

impl PolicyRule {
    pub fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        let when = &self.when;
        let req = ctx.request;

        if !listed(&when.actions, &req.action)
            || !listed(&when.resource_types, &req.resource_type)
            || !listed(&when.source_agents, &req.source_agent)
        {
            return false;
        }
        if when.except_agents.iter().any(|a| a == &req.source_agent) {
            return false;
        }
        if !when.target_agents.is_empty() {
            match &req.target_agent {
                Some(target) if when.target_agents.iter().any(|a| a == target) => {}
                _ => return false,
            }
        }
        if when.content_clean && !ctx.scan.is_clean() {
            return false;
        }
        for (key, allowed) in &when.unless_metadata {
            if let Some(value) = req.metadata_str(key) {
                if allowed.iter().any(|a| a == &value) {
                    return false;
                }
            }
        }
        if let Some(max) = when.max_risk {
            if ctx.risk_score >= max {
                return false;
            }
        }
        true
    }
}

/// A parsed bundle document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyBundle {
    pub namespace: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PolicyBundle {
    /// Parse and validate a bundle. Returns a human-readable reason on
    /// failure; the caller decides which error that becomes.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let bundle: PolicyBundle =
            serde_yaml::from_str(raw).map_err(|e| format!("invalid YAML: {}", e))?;
        bundle.validate()?;
        Ok(bundle)
    }

    fn validate(&self) -> Result<(), String> {
        if self.namespace.trim().is_empty() {
            return Err("namespace is empty".into());
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err("rule with empty name".into());
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(format!("duplicate rule name '{}'", rule.name));
            }
            if let Some(max) = rule.when.max_risk {
                if !(0.0..=1.0).contains(&max) {
                    return Err(format!("rule '{}' has max_risk outside [0,1]", rule.name));
                }
            }
        }
        Ok(())
    }

    pub fn rule(&self, name: &str) -> Option<&PolicyRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
namespace: custom.team
version: "1.0.0"
rules:
  - name: allow_reports
    effect: allow
    reason: reports are readable
    when:
      actions: [read]
      resource_types: [report]
  - name: block_external
    effect: deny
    when:
      actions: [network_request]
      unless_metadata:
        destination: [localhost]
"#;

    fn ctx<'a>(req: &'a EvaluationRequest, scan: &'a ContentScan) -> MatchContext<'a> {
        MatchContext {
            request: req,
            scan,
            risk_score: 0.1,
        }
    }

    #[test]
    fn parses_sample_bundle() {
        let bundle = PolicyBundle::parse(SAMPLE).unwrap();
        assert_eq!(bundle.namespace, "custom.team");
        assert_eq!(bundle.rules.len(), 2);
        assert_eq!(bundle.rule("allow_reports").unwrap().effect, RuleEffect::Allow);
    }

    #[test]
    fn rejects_duplicate_names_and_empty_namespace() {
        let dup = "namespace: x\nrules:\n  - {name: a, effect: allow}\n  - {name: a, effect: deny}\n";
        assert!(PolicyBundle::parse(dup).unwrap_err().contains("duplicate"));
        assert!(PolicyBundle::parse("namespace: ''\n").is_err());
        assert!(PolicyBundle::parse("namespace: [unclosed").is_err());
    }

    #[test]
    fn empty_filters_match_anything() {
        let rule = PolicyRule {
            name: "any".into(),
            effect: RuleEffect::Deny,
            reason: String::new(),
            when: RuleCondition::default(),
        };
        let req = EvaluationRequest::new("whatever", "thing", "someone");
        assert!(rule.matches(&ctx(&req, &ContentScan::default())));
    }

    #[test]
    fn unless_metadata_exempts_listed_values() {
        let bundle = PolicyBundle::parse(SAMPLE).unwrap();
        let rule = bundle.rule("block_external").unwrap();
        let scan = ContentScan::default();

        let local = EvaluationRequest::new("network_request", "api", "actor")
            .with_metadata("destination", json!("localhost"));
        let remote = EvaluationRequest::new("network_request", "api", "actor")
            .with_metadata("destination", json!("evil.example"));
        let unspecified = EvaluationRequest::new("network_request", "api", "actor");

        assert!(!rule.matches(&ctx(&local, &scan)));
        assert!(rule.matches(&ctx(&remote, &scan)));
        assert!(rule.matches(&ctx(&unspecified, &scan)));
    }

    #[test]
    fn target_and_except_filters() {
        let rule = PolicyRule {
            name: "talk".into(),
            effect: RuleEffect::Allow,
            reason: String::new(),
            when: RuleCondition {
                target_agents: vec!["planner".into()],
                except_agents: vec!["rogue".into()],
                ..Default::default()
            },
        };
        let scan = ContentScan::default();
        let ok = EvaluationRequest::new("agent_communication", "message", "actor")
            .with_target("planner");
        let no_target = EvaluationRequest::new("agent_communication", "message", "actor");
        let rogue = EvaluationRequest::new("agent_communication", "message", "rogue")
            .with_target("planner");
        assert!(rule.matches(&ctx(&ok, &scan)));
        assert!(!rule.matches(&ctx(&no_target, &scan)));
        assert!(!rule.matches(&ctx(&rogue, &scan)));
    }

    #[test]
    fn max_risk_bounds_the_match() {
        let rule = PolicyRule {
            name: "cheap".into(),
            effect: RuleEffect::Allow,
            reason: String::new(),
            when: RuleCondition {
                max_risk: Some(0.3),
                ..Default::default()
            },
        };
        let req = EvaluationRequest::new("write", "log", "actor");
        let scan = ContentScan::default();
        let low = MatchContext { request: &req, scan: &scan, risk_score: 0.24 };
        let high = MatchContext { request: &req, scan: &scan, risk_score: 0.3 };
        assert!(rule.matches(&low));
        assert!(!rule.matches(&high));
    }
}
