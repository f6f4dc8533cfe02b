// Integration tests for the validation gate: end-to-end scenarios, fail-safe
// behavior, overrides, workflows and restart semantics.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use warden_audit::{AuditTrail, Ed25519Signer, RecordKind, Signer, TrailOptions};
use warden_gate::{
    DecisionRegistry, EmergencyEvent, EmergencyEventType, EmergencyLevel, EmergencyManager,
    EvaluationBackend, FailSafeMode, GateConfig, GateError, GateParts, GateRuntime, HttpBackend,
    OverrideDecision, OverrideHandler, OverrideRequest, PolicyDecision, ShutdownCallback,
    SystemStateKind, ValidationGate,
};
use warden_policy::{
    Clock, EvaluationRequest, EvaluationResponse, LocalInterpreter, PolicyLoader, PolicySet,
    PolicyStore, RiskConfig, RiskScorer,
};

// ── Helpers ──

fn midday() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
}

fn two_am() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 2, 0, 0).unwrap()
}

fn read_document(agent: &str) -> EvaluationRequest {
    EvaluationRequest::new("read", "document", agent).with_timestamp(midday())
}

async fn open(dir: &TempDir) -> GateRuntime {
    open_at(dir, midday()).await
}

async fn open_at(dir: &TempDir, now: chrono::DateTime<Utc>) -> GateRuntime {
    GateRuntime::open_with_clock(GateConfig::for_project(dir.path()), false, Clock::Fixed(now))
        .await
        .unwrap()
}

async fn gate_with_backend(
    dir: &TempDir,
    backend: Arc<dyn EvaluationBackend>,
    fail_safe: FailSafeMode,
    backend_timeout: Duration,
) -> ValidationGate {
    let config = GateConfig::for_project(dir.path());
    let signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::load_or_generate(&config.signing_key).unwrap());
    let audit = AuditTrail::start(&config.audit_log, signer, TrailOptions::default()).unwrap();
    let store = Arc::new(PolicyStore::open(PolicyLoader::new(config.loader_config())).unwrap());
    let scorer = RiskScorer::new(RiskConfig::default())
        .unwrap()
        .with_clock(Clock::Fixed(midday()));
    let emergency = Arc::new(EmergencyManager::new(audit.clone(), Duration::from_secs(1)));
    let registry = Arc::new(DecisionRegistry::default());
    let overrides = Arc::new(OverrideHandler::new(
        audit.clone(),
        Arc::clone(&emergency),
        Arc::clone(&registry),
    ));
    ValidationGate::new(GateParts {
        store,
        backend,
        fallback: LocalInterpreter::with_scorer(scorer.clone()),
        scorer,
        emergency,
        overrides,
        registry,
        audit,
        fail_safe,
        backend_timeout,
    })
}

fn override_for(decision: &PolicyDecision, chain: Vec<&str>, valid_for: chrono::Duration) -> OverrideRequest {
    OverrideRequest {
        admin_id: "admin-1".into(),
        justification: "approved for incident INC-7".into(),
        approval_chain: chain.into_iter().map(String::from).collect(),
        original_decision_id: decision.decision_id,
        override_decision: OverrideDecision::Allow,
        valid_until: Utc::now() + valid_for,
    }
}

struct SlowBackend;

#[async_trait]
impl EvaluationBackend for SlowBackend {
    fn name(&self) -> &str {
        "slow"
    }
    async fn evaluate(
        &self,
        _set: &PolicySet,
        _request: &EvaluationRequest,
    ) -> Result<EvaluationResponse, GateError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(EvaluationResponse::default())
    }
    async fn health_check(&self) -> bool {
        true
    }
}

struct FailingBackend;

#[async_trait]
impl EvaluationBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }
    async fn evaluate(
        &self,
        _set: &PolicySet,
        _request: &EvaluationRequest,
    ) -> Result<EvaluationResponse, GateError> {
        Err(GateError::Backend("connection refused".into()))
    }
    async fn health_check(&self) -> bool {
        false
    }
}

struct PanickingBackend;

#[async_trait]
impl EvaluationBackend for PanickingBackend {
    fn name(&self) -> &str {
        "panicking"
    }
    async fn evaluate(
        &self,
        _set: &PolicySet,
        _request: &EvaluationRequest,
    ) -> Result<EvaluationResponse, GateError> {
        panic!("evaluator bug");
    }
    async fn health_check(&self) -> bool {
        true
    }
}

struct CountingBackend {
    calls: AtomicUsize,
    local: LocalInterpreter,
}

#[async_trait]
impl EvaluationBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }
    async fn evaluate(
        &self,
        set: &PolicySet,
        request: &EvaluationRequest,
    ) -> Result<EvaluationResponse, GateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.local.evaluate(set, request))
    }
    async fn health_check(&self) -> bool {
        true
    }
}

// ── Scenarios ──

#[tokio::test]
async fn self_replication_is_denied_even_when_custom_policy_allows_it() {
    let dir = TempDir::new().unwrap();
    let local = dir.path().join(".warden/policies/local");
    fs::create_dir_all(&local).unwrap();
    fs::write(
        local.join("permissive.policy.yaml"),
        "namespace: team\nrules:\n  - name: allow_spawn\n    effect: allow\n    when:\n      actions: [create_agent]\n",
    )
    .unwrap();

    let rt = open(&dir).await;
    let decision = rt
        .gate
        .evaluate(EvaluationRequest::new("create_agent", "agent", "planner"))
        .await
        .unwrap();

    assert!(!decision.allow);
    assert!(decision.deny);
    assert!(decision
        .reasons
        .iter()
        .any(|r| r.contains("self-replication blocked")));
    assert!(decision
        .evaluated_policies
        .contains(&"team.allow_spawn".to_string()));
}

#[tokio::test]
async fn low_risk_read_is_allowed() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let decision = rt.gate.evaluate(read_document("planner")).await.unwrap();

    assert!(decision.allow);
    assert!(!decision.deny);
    assert!((decision.risk_score - 0.1).abs() < 1e-9);
    assert_eq!(decision.system_state, SystemStateKind::Normal);
    assert_eq!(decision.policy_generation, Some(1));
}

#[tokio::test]
async fn off_hours_comes_from_evaluation_time_not_the_request() {
    let dir = TempDir::new().unwrap();
    let local = dir.path().join(".warden/policies/local");
    fs::create_dir_all(&local).unwrap();
    fs::write(
        local.join("net.policy.yaml"),
        "namespace: team\nrules:\n  - name: local_fetch\n    effect: allow\n    when:\n      actions: [network_request]\n      resource_types: [document]\n",
    )
    .unwrap();
    // Back-dated to midday; the gate evaluates it at 02:00.
    let request = EvaluationRequest::new("network_request", "document", "actor")
        .with_timestamp(midday())
        .with_metadata("destination", serde_json::json!("localhost"));

    let night = open_at(&dir, two_am()).await;
    let decision = night.gate.evaluate(request.clone()).await.unwrap();
    assert!(decision.deny);
    assert_eq!(decision.risk_score, 1.0);
    assert!(decision.reasons.contains(&"high_risk_score".to_string()));
    assert!(decision.reasons.contains(&"risk_factor:off_hours".to_string()));
    night.gate.audit().flush().await.unwrap();
    drop(night);

    let day = open_at(&dir, midday()).await;
    let decision = day.gate.evaluate(request).await.unwrap();
    assert!(decision.allow, "{:?}", decision.reasons);
    assert!((decision.risk_score - 0.75).abs() < 1e-9);
}

#[tokio::test]
async fn decisions_are_on_disk_before_they_are_returned() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    assert_eq!(rt.config.fail_safe, FailSafeMode::Deny);
    let decision = rt.gate.evaluate(read_document("planner")).await.unwrap();

    // No flush: the log file is read directly.
    let records = warden_audit::AuditLog::read_all(&rt.config.audit_log).unwrap();
    assert!(records.iter().any(|r| r.kind == RecordKind::Decision
        && r.payload["decision_id"] == serde_json::json!(decision.decision_id)));
}

#[tokio::test]
async fn emergency_mode_denies_until_it_expires() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    rt.gate
        .emergency()
        .enter_emergency_mode(
            "test",
            "soc",
            Some(chrono::Duration::milliseconds(300)),
            EmergencyEventType::Manual,
            EmergencyLevel::High,
        )
        .await
        .unwrap();

    let denied = rt.gate.evaluate(read_document("planner")).await.unwrap();
    assert!(denied.deny);
    assert_eq!(denied.reasons, vec!["emergency_mode_active"]);
    assert_eq!(denied.system_state, SystemStateKind::EmergencyMode);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let allowed = rt.gate.evaluate(read_document("planner")).await.unwrap();
    assert!(allowed.allow);
    assert_eq!(rt.gate.emergency().kind(), SystemStateKind::Normal);
    let history = rt.gate.emergency().history(1);
    assert_eq!(history[0].event_type, EmergencyEventType::AutoExpiry);
}

#[tokio::test]
async fn emergency_mode_never_reaches_the_backend() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(CountingBackend {
        calls: AtomicUsize::new(0),
        local: LocalInterpreter::new(RiskConfig::default()).unwrap(),
    });
    let gate = gate_with_backend(
        &dir,
        Arc::clone(&backend) as Arc<dyn EvaluationBackend>,
        FailSafeMode::Deny,
        Duration::from_millis(250),
    )
    .await;

    gate.evaluate(read_document("planner")).await.unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    gate.emergency()
        .enter_maintenance("patch window", "ops", None)
        .await
        .unwrap();
    let decision = gate.evaluate(read_document("planner")).await.unwrap();
    assert_eq!(decision.reasons, vec!["maintenance_mode_active"]);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

struct Recorder {
    name: String,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ShutdownCallback for Recorder {
    fn name(&self) -> &str {
        &self.name
    }
    async fn on_shutdown(&self, _event: &EmergencyEvent) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err("drain failed".into())
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn shutdown_runs_every_callback_and_persists() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let calls = Arc::new(AtomicUsize::new(0));
    for (name, fail) in [("raises", true), ("drains", false)] {
        rt.gate.emergency().register_shutdown_callback(Arc::new(Recorder {
            name: name.into(),
            fail,
            calls: Arc::clone(&calls),
        }));
    }

    let report = rt
        .gate
        .emergency()
        .shutdown(
            "breach",
            "soc",
            EmergencyEventType::SecurityBreach,
            EmergencyLevel::Critical,
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(report.transition.persisted);
    assert_eq!(report.callbacks.len(), 2);
    assert!(!report.callbacks[0].succeeded);
    assert!(report.callbacks[1].succeeded);
    assert_eq!(rt.gate.emergency().kind(), SystemStateKind::Shutdown);

    let records = rt.gate.audit().read_all().await.unwrap();
    let last_event = records
        .iter()
        .rev()
        .find(|r| r.kind == RecordKind::EmergencyEvent)
        .unwrap()
        .payload_as::<EmergencyEvent>()
        .unwrap();
    assert_eq!(last_event.to_state, SystemStateKind::Shutdown);
    assert_eq!(last_event.reason, "breach");

    let decision = rt.gate.evaluate(read_document("planner")).await.unwrap();
    assert_eq!(decision.reasons, vec!["system_shutdown"]);
}

#[tokio::test]
async fn override_without_approval_chain_is_rejected() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let decision = rt
        .gate
        .evaluate(EvaluationRequest::new("write", "document", "actor").with_timestamp(midday()))
        .await
        .unwrap();
    assert!(decision.deny);

    let err = rt
        .gate
        .overrides()
        .submit(override_for(&decision, vec![], chrono::Duration::hours(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::OverrideApproval(_)));

    let err = rt
        .gate
        .overrides()
        .submit(override_for(&decision, vec!["lead", "  "], chrono::Duration::hours(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::OverrideApproval(_)));

    let stored = rt
        .gate
        .audit()
        .find_decision(decision.decision_id)
        .await
        .unwrap()
        .unwrap()
        .payload_as::<PolicyDecision>()
        .unwrap();
    assert_eq!(stored, decision);
    assert!(rt.gate.overrides().active().is_empty());
}

// ── Overrides ──

#[tokio::test]
async fn accepted_override_applies_until_it_expires() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let request = EvaluationRequest::new("write", "document", "actor").with_timestamp(midday());
    let denied = rt.gate.evaluate(request.clone()).await.unwrap();
    assert!(denied.reasons.contains(&"no_matching_allow_rule".to_string()));

    let record = rt
        .gate
        .overrides()
        .submit(override_for(
            &denied,
            vec!["team-lead", "security"],
            chrono::Duration::milliseconds(400),
        ))
        .await
        .unwrap();
    assert_eq!(record.fingerprint.action, "write");

    let allowed = rt.gate.evaluate(request.clone()).await.unwrap();
    assert!(allowed.allow);
    assert_eq!(allowed.override_id, Some(record.override_id));

    // A different agent is not covered.
    let other = rt
        .gate
        .evaluate(EvaluationRequest::new("write", "document", "observer").with_timestamp(midday()))
        .await
        .unwrap();
    assert!(other.deny);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let expired = rt.gate.evaluate(request).await.unwrap();
    assert!(expired.deny);
    assert!(expired.override_id.is_none());
    assert!(rt.gate.overrides().active().is_empty());

    let records = rt.gate.audit().read_all().await.unwrap();
    assert_eq!(
        records.iter().filter(|r| r.kind == RecordKind::Override).count(),
        1
    );
}

#[tokio::test]
async fn allow_override_does_not_lift_core_deny() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let request = EvaluationRequest::new("create_agent", "agent", "planner");
    let denied = rt.gate.evaluate(request.clone()).await.unwrap();
    rt.gate
        .overrides()
        .submit(override_for(&denied, vec!["cto"], chrono::Duration::hours(1)))
        .await
        .unwrap();

    let still_denied = rt.gate.evaluate(request).await.unwrap();
    assert!(still_denied.deny);
    assert!(still_denied
        .reasons
        .contains(&"override_ignored_core_deny".to_string()));
}

#[tokio::test]
async fn override_preconditions() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let decision = rt.gate.evaluate(read_document("planner")).await.unwrap();

    let mut unknown = override_for(&decision, vec!["lead"], chrono::Duration::hours(1));
    unknown.original_decision_id = uuid::Uuid::new_v4();
    assert!(matches!(
        rt.gate.overrides().submit(unknown).await.unwrap_err(),
        GateError::OverrideApproval(_)
    ));

    let past = override_for(&decision, vec!["lead"], chrono::Duration::seconds(-5));
    assert!(matches!(
        rt.gate.overrides().submit(past).await.unwrap_err(),
        GateError::OverrideApproval(_)
    ));

    rt.gate
        .emergency()
        .shutdown("halt", "ops", EmergencyEventType::ManualShutdown, EmergencyLevel::High)
        .await
        .unwrap();
    let after_shutdown = override_for(&decision, vec!["lead"], chrono::Duration::hours(1));
    assert!(matches!(
        rt.gate.overrides().submit(after_shutdown).await.unwrap_err(),
        GateError::InvalidStateTransition { .. }
    ));
}

#[tokio::test]
async fn override_lookup_falls_back_to_audit_log_after_restart() {
    let dir = TempDir::new().unwrap();
    let decision = {
        let rt = open(&dir).await;
        let d = rt
            .gate
            .evaluate(EvaluationRequest::new("write", "document", "actor").with_timestamp(midday()))
            .await
            .unwrap();
        rt.gate.audit().flush().await.unwrap();
        d
    };

    let rt = open(&dir).await;
    let record = rt
        .gate
        .overrides()
        .submit(override_for(&decision, vec!["lead"], chrono::Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(record.fingerprint.source_agent, "actor");
    rt.gate.audit().flush().await.unwrap();
    drop(rt);

    // And the accepted override comes back after another restart.
    let rt = open(&dir).await;
    assert_eq!(rt.gate.overrides().active().len(), 1);
    let report = rt.gate.audit().validate_integrity().await.unwrap();
    assert!(report.valid, "{:?}", report.first_break);
}

// ── Fail-safe ──

#[tokio::test]
async fn backend_timeout_is_a_fail_safe_deny() {
    let dir = TempDir::new().unwrap();
    let gate = gate_with_backend(
        &dir,
        Arc::new(SlowBackend),
        FailSafeMode::Deny,
        Duration::from_millis(50),
    )
    .await;

    let started = std::time::Instant::now();
    let decision = gate.evaluate(read_document("planner")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(decision.deny && !decision.allow);
    assert!(decision.fail_safe);
    assert_eq!(decision.reasons, vec!["evaluation_backend_timeout"]);
    assert_eq!(decision.risk_score, 1.0);
}

#[tokio::test]
async fn warn_mode_falls_back_to_local_policy() {
    let dir = TempDir::new().unwrap();
    let gate = gate_with_backend(
        &dir,
        Arc::new(FailingBackend),
        FailSafeMode::Warn,
        Duration::from_millis(250),
    )
    .await;

    let read = gate.evaluate(read_document("planner")).await.unwrap();
    assert!(read.allow);
    assert!(read
        .reasons
        .contains(&"evaluation_backend_error:local_fallback".to_string()));
}

#[tokio::test]
async fn allow_mode_never_fails_open() {
    let dir = TempDir::new().unwrap();
    let gate = gate_with_backend(
        &dir,
        Arc::new(FailingBackend),
        FailSafeMode::Allow,
        Duration::from_millis(250),
    )
    .await;

    let spawn = gate
        .evaluate(EvaluationRequest::new("create_agent", "agent", "planner"))
        .await
        .unwrap();
    assert!(spawn.deny);
    let unknown = gate
        .evaluate(EvaluationRequest::new("teleport", "mystery", "planner").with_timestamp(midday()))
        .await
        .unwrap();
    assert!(unknown.deny);
}

#[tokio::test]
async fn backend_panic_is_an_internal_error_deny() {
    let dir = TempDir::new().unwrap();
    let gate = gate_with_backend(
        &dir,
        Arc::new(PanickingBackend),
        FailSafeMode::Warn,
        Duration::from_millis(250),
    )
    .await;
    let decision = gate.evaluate(read_document("planner")).await.unwrap();
    assert!(decision.deny);
    assert_eq!(decision.reasons, vec!["internal_evaluation_error"]);

    // The decision is still audited.
    let found = gate.audit().find_decision(decision.decision_id).await.unwrap();
    assert!(found.is_some());
}

// ── Workflows and helpers ──

#[tokio::test]
async fn workflow_stops_at_first_denial() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let steps = vec![
        read_document("planner"),
        EvaluationRequest::new("create_agent", "agent", "planner"),
        read_document("planner"),
    ];
    let result = rt.gate.evaluate_workflow(steps).await.unwrap();

    assert!(result.deny && !result.allow);
    assert_eq!(result.total_steps, 3);
    assert_eq!(result.denied_at, Some(1));
    assert_eq!(result.decisions.len(), 2);
    assert_eq!(result.high_risk_steps, 1);
    assert!((result.average_risk - (0.1 + 1.0) / 2.0).abs() < 0.3);
    assert_eq!(result.reasons[0], "step_1_denied");
}

#[tokio::test]
async fn empty_workflow_is_denied() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let result = rt.gate.evaluate_workflow(vec![]).await.unwrap();
    assert!(result.deny);
    assert_eq!(result.reasons, vec!["empty_workflow"]);
}

#[tokio::test]
async fn agent_communication_between_registered_agents() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let ok = rt
        .gate
        .validate_agent_communication("planner", "actor", Some("next task: summarize".into()))
        .await
        .unwrap();
    assert!(ok.allow, "{:?}", ok.reasons);

    let leaked = rt
        .gate
        .validate_agent_communication("planner", "actor", Some("ssn 123-45-6789".into()))
        .await
        .unwrap();
    assert!(leaked.deny);

    let stranger = rt
        .gate
        .validate_agent_communication("rogue", "actor", None)
        .await
        .unwrap();
    assert!(stranger.deny);
}

#[tokio::test]
async fn resource_access_on_credentials_is_denied() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let decision = rt
        .gate
        .validate_resource_access("actor", "read", "credentials", None)
        .await
        .unwrap();
    assert!(decision.deny);
    assert!(decision
        .remediation
        .contains(&"Critical resource access requires human approval".to_string()));
}

// ── Restart, reload and audit ──

#[tokio::test]
async fn restart_after_shutdown_requires_acknowledgement() {
    let dir = TempDir::new().unwrap();
    {
        let rt = open(&dir).await;
        rt.gate
            .emergency()
            .shutdown("breach", "soc", EmergencyEventType::SecurityBreach, EmergencyLevel::Critical)
            .await
            .unwrap();
        rt.gate.audit().flush().await.unwrap();
    }

    let err = GateRuntime::open(GateConfig::for_project(dir.path()), false)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GateError::ShutdownPersisted { .. }));

    let rt = GateRuntime::open(GateConfig::for_project(dir.path()), true)
        .await
        .unwrap();
    assert_eq!(rt.gate.emergency().kind(), SystemStateKind::Normal);
    let decision = rt.gate.evaluate(read_document("planner")).await.unwrap();
    assert!(decision.allow);
}

#[tokio::test]
async fn unexpired_emergency_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let rt = open(&dir).await;
        rt.gate
            .emergency()
            .enter_emergency_mode(
                "breach",
                "soc",
                Some(chrono::Duration::hours(1)),
                EmergencyEventType::SecurityBreach,
                EmergencyLevel::High,
            )
            .await
            .unwrap();
        rt.gate.audit().flush().await.unwrap();
    }
    let rt = open(&dir).await;
    assert_eq!(rt.gate.emergency().kind(), SystemStateKind::EmergencyMode);
}

#[tokio::test]
async fn reload_picks_up_new_bundles_and_is_audited() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let request = EvaluationRequest::new("write", "document", "actor").with_timestamp(midday());
    assert!(rt.gate.evaluate(request.clone()).await.unwrap().deny);

    let local = dir.path().join(".warden/policies/local");
    fs::create_dir_all(&local).unwrap();
    fs::write(
        local.join("docs.policy.yaml"),
        "namespace: team.docs\nrules:\n  - name: actor_writes_docs\n    effect: allow\n    when:\n      actions: [write]\n      resource_types: [document]\n      source_agents: [actor]\n",
    )
    .unwrap();

    let summary = rt.gate.reload_policies().await.unwrap();
    assert_eq!(summary.generation, 2);

    let decision = rt.gate.evaluate(request).await.unwrap();
    assert!(decision.allow, "{:?}", decision.reasons);
    assert_eq!(decision.policy_generation, Some(2));

    let records = rt.gate.audit().read_all().await.unwrap();
    assert_eq!(
        records
            .iter()
            .filter(|r| r.kind == RecordKind::PolicyReload)
            .count(),
        2
    );
}

#[tokio::test]
async fn every_decision_lands_in_a_valid_chain() {
    let dir = TempDir::new().unwrap();
    let rt = open(&dir).await;
    let mut handles = Vec::new();
    for i in 0..20 {
        let gate = rt.gate.clone();
        handles.push(tokio::spawn(async move {
            gate.evaluate(read_document(if i % 2 == 0 { "planner" } else { "actor" }))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let report = rt.gate.audit().validate_integrity().await.unwrap();
    assert!(report.valid, "{:?}", report.first_break);
    let records = rt.gate.audit().read_all().await.unwrap();
    assert_eq!(
        records.iter().filter(|r| r.kind == RecordKind::Decision).count(),
        20
    );
}

// ── HTTP backend ──

#[tokio::test]
async fn http_backend_round_trip() {
    use axum::routing::{get, post};
    use axum::{Json, Router};

    let app = Router::new()
        .route(
            "/v1/data/warden",
            post(|Json(body): Json<serde_json::Value>| async move {
                let allow = body["input"]["action"] == "read";
                Json(serde_json::json!({
                    "result": {
                        "core": {"allow": allow, "deny": !allow, "reasons": if allow { vec![] } else { vec!["remote deny"] }},
                        "custom": {"allow": false, "deny": false}
                    }
                }))
            }),
        )
        .route("/v1/data/warden/health", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let backend = HttpBackend::new(
        format!("http://{}/v1/data/warden", addr),
        Duration::from_secs(2),
    )
    .unwrap();
    assert!(backend.health_check().await);

    let dir = TempDir::new().unwrap();
    let gate = gate_with_backend(
        &dir,
        Arc::new(backend),
        FailSafeMode::Deny,
        Duration::from_secs(2),
    )
    .await;

    let read = gate.evaluate(read_document("planner")).await.unwrap();
    assert!(read.allow, "{:?}", read.reasons);
    let write = gate
        .evaluate(EvaluationRequest::new("write", "temp_file", "planner").with_timestamp(midday()))
        .await
        .unwrap();
    assert!(write.deny);
    assert!(write.reasons.contains(&"remote deny".to_string()));
}

#[tokio::test]
async fn backend_answer_without_core_is_a_fail_safe_deny() {
    use axum::routing::post;
    use axum::{Json, Router};

    let app = Router::new().route(
        "/v1/data/warden",
        post(|| async { Json(serde_json::json!({"custom": {"allow": true, "deny": false}})) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let backend = HttpBackend::new(
        format!("http://{}/v1/data/warden", addr),
        Duration::from_secs(2),
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let gate = gate_with_backend(
        &dir,
        Arc::new(backend),
        FailSafeMode::Deny,
        Duration::from_secs(2),
    )
    .await;

    let decision = gate
        .evaluate(EvaluationRequest::new("write", "temp_file", "planner"))
        .await
        .unwrap();
    assert!(!decision.allow);
    assert!(decision.deny && decision.fail_safe);
    assert_eq!(decision.reasons, vec!["evaluation_backend_error"]);
}

#[tokio::test]
async fn unreachable_http_backend_is_a_fail_safe_deny() {
    let dir = TempDir::new().unwrap();
    let backend = HttpBackend::new("http://127.0.0.1:9/v1/data/warden", Duration::from_millis(200)).unwrap();
    assert!(!backend.health_check().await);
    let gate = gate_with_backend(
        &dir,
        Arc::new(backend),
        FailSafeMode::Deny,
        Duration::from_millis(250),
    )
    .await;
    let decision = gate.evaluate(read_document("planner")).await.unwrap();
    assert!(decision.deny && decision.fail_safe);
    assert!(
        decision.reasons == vec!["evaluation_backend_error"]
            || decision.reasons == vec!["evaluation_backend_timeout"]
    );
}
