// risk.rs: Risk Scoring Engine.
//
// score = clamp(base_action_risk × resource_multiplier × context_modifier
//               + content penalties, 0, 1)
//
// The tables are plain configuration (`RiskConfig`), not code: operators can
// tune them from `warden.toml` without touching the engine.
//
// Context modifier:
//   - off-hours (UTC hour < 8 or > 18)            ×1.3
//   - sensitive action class                      ×1.5
//   - both at once                                ×2.0 (its own constant)
//   - metadata `external_source: true`            ×1.4, applied on top
//
// Content penalties are additive and counted once per family.
//
// The off-hours check uses the scorer's clock, never the request's own
// `timestamp`: that field is caller-supplied and only informational.

use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{ContentDetector, ContentFinding};
use crate::error::PolicyError;
use crate::request::EvaluationRequest;

/// Tunable risk tables and constants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    pub action_risk: BTreeMap<String, f64>,
    pub resource_multipliers: BTreeMap<String, f64>,
    pub default_action_risk: f64,
    pub default_resource_multiplier: f64,
    pub sensitive_actions: Vec<String>,
    pub off_hours_start: u32,
    pub off_hours_end: u32,
    pub off_hours_multiplier: f64,
    pub sensitive_action_multiplier: f64,
    pub combined_multiplier: f64,
    pub external_source_multiplier: f64,
    pub sensitive_content_penalty: f64,
    pub malicious_content_penalty: f64,
    pub high_risk_threshold: f64,
}

fn table(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            action_risk: table(&[
                ("read", 0.1),
                ("write", 0.4),
                ("delete", 0.8),
                ("execute", 0.7),
                ("modify", 0.6),
                ("network_request", 0.5),
                ("agent_communication", 0.2),
                ("create_agent", 1.0),
                ("spawn_process", 1.0),
                ("system", 1.0),
            ]),
            resource_multipliers: table(&[
                ("document", 1.0),
                ("temp_file", 0.8),
                ("log", 0.6),
                ("cache", 0.7),
                ("config", 1.5),
                ("agent_card", 1.2),
                ("system_config", 3.0),
                ("policy", 3.0),
                ("credentials", 3.0),
                ("keys", 3.0),
                ("certificates", 3.0),
                ("system", 3.0),
            ]),
            default_action_risk: 0.5,
            default_resource_multiplier: 1.0,
            sensitive_actions: [
                "delete",
                "execute",
                "modify",
                "shell",
                "system",
                "network_request",
                "create_agent",
                "spawn_process",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            off_hours_start: 8,
            off_hours_end: 18,
            off_hours_multiplier: 1.3,
            sensitive_action_multiplier: 1.5,
            combined_multiplier: 2.0,
            external_source_multiplier: 1.4,
            sensitive_content_penalty: 0.5,
            malicious_content_penalty: 0.5,
            high_risk_threshold: 0.8,
        }
    }
}

impl RiskConfig {
    /// Reject tables the scorer cannot use safely.
    ///
    /// Weights must be finite and non-negative, the threshold within
    /// [0, 1] and the off-hours bounds valid UTC hours.
    pub fn check(&self) -> Result<(), String> {
        fn weight(name: &str, value: f64) -> Result<(), String> {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(format!("{} must be a finite non-negative number, got {}", name, value))
            }
        }

        if !(0.0..=1.0).contains(&self.high_risk_threshold) {
            return Err(format!(
                "high_risk_threshold must be within [0, 1], got {}",
                self.high_risk_threshold
            ));
        }
        for (action, value) in &self.action_risk {
            weight(&format!("action_risk.{}", action), *value)?;
        }
        for (resource, value) in &self.resource_multipliers {
            weight(&format!("resource_multipliers.{}", resource), *value)?;
        }
        weight("default_action_risk", self.default_action_risk)?;
        weight("default_resource_multiplier", self.default_resource_multiplier)?;
        weight("off_hours_multiplier", self.off_hours_multiplier)?;
        weight("sensitive_action_multiplier", self.sensitive_action_multiplier)?;
        weight("combined_multiplier", self.combined_multiplier)?;
        weight("external_source_multiplier", self.external_source_multiplier)?;
        weight("sensitive_content_penalty", self.sensitive_content_penalty)?;
        weight("malicious_content_penalty", self.malicious_content_penalty)?;
        if self.off_hours_start > 23 || self.off_hours_end > 23 {
            return Err("off_hours_start and off_hours_end must be hours 0-23".to_string());
        }
        Ok(())
    }
}

/// A factor that raised the score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    OffHours,
    SensitiveAction,
    ExternalSource,
    SensitiveContent,
    MaliciousContent,
}

impl std::fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskFactor::OffHours => "off_hours",
            RiskFactor::SensitiveAction => "sensitive_action",
            RiskFactor::ExternalSource => "external_source",
            RiskFactor::SensitiveContent => "sensitive_content",
            RiskFactor::MaliciousContent => "malicious_content",
        };
        write!(f, "{}", s)
    }
}

/// Score plus the inputs that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub score: f64,
    pub base: f64,
    pub resource_multiplier: f64,
    pub context_modifier: f64,
    pub penalty: f64,
    pub factors: Vec<RiskFactor>,
    pub findings: Vec<ContentFinding>,
    pub high_risk: bool,
}

/// Time source for the off-hours check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Clock {
    #[default]
    System,
    /// Always reports the same instant. Used by tests and replays.
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at,
        }
    }
}

/// Computes risk scores from a `RiskConfig`.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: RiskConfig,
    detector: ContentDetector,
    clock: Clock,
}

impl RiskScorer {
    pub fn new(config: RiskConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            config,
            detector: ContentDetector::new()?,
            clock: Clock::System,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn detector(&self) -> &ContentDetector {
        &self.detector
    }

    /// Score a request at the current evaluation time.
    pub fn score(&self, request: &EvaluationRequest) -> RiskAssessment {
        self.score_at(request, self.clock.now())
    }

    pub fn score_at(&self, request: &EvaluationRequest, at: DateTime<Utc>) -> RiskAssessment {
        let cfg = &self.config;
        let base = cfg
            .action_risk
            .get(&request.action)
            .copied()
            .unwrap_or(cfg.default_action_risk);
        let resource_multiplier = cfg
            .resource_multipliers
            .get(&request.resource_type)
            .copied()
            .unwrap_or(cfg.default_resource_multiplier);

        let mut factors = Vec::new();
        let hour = at.hour();
        let off_hours = hour < cfg.off_hours_start || hour > cfg.off_hours_end;
        let sensitive_action = cfg.sensitive_actions.iter().any(|a| a == &request.action);

        let mut context_modifier = match (off_hours, sensitive_action) {
            (true, true) => cfg.combined_multiplier,
            (true, false) => cfg.off_hours_multiplier,
            (false, true) => cfg.sensitive_action_multiplier,
            (false, false) => 1.0,
        };
        if off_hours {
            factors.push(RiskFactor::OffHours);
        }
        if sensitive_action {
            factors.push(RiskFactor::SensitiveAction);
        }
        if request.metadata_flag("external_source") {
            context_modifier *= cfg.external_source_multiplier;
            factors.push(RiskFactor::ExternalSource);
        }

        let scan = self.detector.scan(request.content.as_deref());
        let mut penalty = 0.0;
        if scan.has_sensitive() {
            penalty += cfg.sensitive_content_penalty;
            factors.push(RiskFactor::SensitiveContent);
        }
        if scan.has_malicious() {
            penalty += cfg.malicious_content_penalty;
            factors.push(RiskFactor::MaliciousContent);
        }

        let raw = base * resource_multiplier * context_modifier + penalty;
        let score = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 1.0 };

        RiskAssessment {
            score,
            base,
            resource_multiplier,
            context_modifier,
            penalty,
            factors,
            findings: scan.findings,
            high_risk: score >= cfg.high_risk_threshold,
        }
    }
}
