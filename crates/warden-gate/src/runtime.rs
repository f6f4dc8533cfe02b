// runtime.rs: Assembles a running gate from a GateConfig.
//
// Startup order matters:
//
//   1. signing key: loaded or generated; failure is fatal
//   2. retention pruning: before the writer opens the log
//   3. audit trail: writer thread started
//   4. policy store: a core integrity failure is fatal
//   5. backend: HTTP when a URL is configured, else local
//   6. emergency restore: a persisted SHUTDOWN refuses to start
//   7. override restore: unexpired overrides come back
//   8. gate
//   9. a policy_reload record for the initial load

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use warden_audit::{prune_before, AuditTrail, Ed25519Signer, RecordKind, Signer};
use warden_policy::{Clock, LocalInterpreter, PolicyLoader, PolicyStore, RiskScorer};

use crate::backend::{EvaluationBackend, HttpBackend, LocalBackend};
use crate::config::GateConfig;
use crate::emergency::{events_from_records, EmergencyManager};
use crate::error::GateError;
use crate::gate::{GateParts, ValidationGate};
use crate::overrides::OverrideHandler;
use crate::registry::DecisionRegistry;

/// A started gate plus the configuration it was built from.
pub struct GateRuntime {
    pub config: GateConfig,
    pub gate: ValidationGate,
}

impl GateRuntime {
    /// Start everything from `config`.
    ///
    /// `acknowledge_shutdown` lets an operator restart after a persisted
    /// SHUTDOWN; without it such a restart fails with `ShutdownPersisted`.
    pub async fn open(config: GateConfig, acknowledge_shutdown: bool) -> Result<Self, GateError> {
        Self::open_with_clock(config, acknowledge_shutdown, Clock::System).await
    }

    /// Like `open`, with the clock risk scoring reads evaluation time from.
    pub async fn open_with_clock(
        config: GateConfig,
        acknowledge_shutdown: bool,
        clock: Clock,
    ) -> Result<Self, GateError> {
        config.validate()?;
        let signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::load_or_generate(&config.signing_key)?);
        tracing::info!(
            key_id = %signer.key_id(),
            algorithm = signer.algorithm(),
            path = %config.signing_key.display(),
            "audit signing key ready"
        );

        if let Some(days) = config.audit_retention_days {
            let horizon = TimeDelta::try_days(i64::from(days))
                .and_then(|age| Utc::now().checked_sub_signed(age))
                .ok_or_else(|| GateError::Config {
                    source_name: "audit.retention_days".to_string(),
                    reason: format!("{} days is out of range", days),
                })?;
            let outcome = prune_before(&config.audit_log, horizon, &*signer)?;
            if outcome.removed > 0 {
                tracing::info!(
                    removed = outcome.removed,
                    retained = outcome.retained,
                    retention_days = days,
                    "pruned audit records past retention"
                );
            }
        }

        let audit = AuditTrail::start(&config.audit_log, Arc::clone(&signer), config.trail_options())?;

        let loader = PolicyLoader::new(config.loader_config());
        let store = Arc::new(
            tokio::task::spawn_blocking(move || PolicyStore::open(loader))
                .await
                .map_err(|e| GateError::Backend(format!("policy load task failed: {}", e)))??,
        );

        let scorer = RiskScorer::new(config.risk.clone())?.with_clock(clock);
        let fallback = LocalInterpreter::with_scorer(scorer.clone());
        let backend: Arc<dyn EvaluationBackend> = match &config.backend_url {
            Some(url) => Arc::new(HttpBackend::new(url.clone(), config.backend_timeout())?),
            None => Arc::new(LocalBackend::new(fallback.clone())),
        };

        let records = audit.read_all().await?;
        let emergency = Arc::new(EmergencyManager::new(
            audit.clone(),
            config.shutdown_callback_timeout(),
        ));
        emergency
            .restore(&events_from_records(&records), acknowledge_shutdown)
            .await?;

        let registry = Arc::new(DecisionRegistry::default());
        let overrides = Arc::new(OverrideHandler::new(
            audit.clone(),
            Arc::clone(&emergency),
            Arc::clone(&registry),
        ));
        let restored = overrides.restore(&records);
        if restored > 0 {
            tracing::info!(count = restored, "restored active overrides");
        }

        let summary = store.snapshot().summary();
        audit
            .append(
                RecordKind::PolicyReload,
                serde_json::json!({
                    "status": "loaded",
                    "generation": summary.generation,
                    "fingerprint": summary.fingerprint,
                    "rule_count": summary.rule_count,
                    "skipped": summary.skipped,
                    "conflicts": summary.conflicts,
                }),
            )
            .await?;

        tracing::info!(
            backend = backend.name(),
            fail_safe = %config.fail_safe,
            state = %emergency.kind(),
            generation = summary.generation,
            rules = summary.rule_count,
            "validation gate ready"
        );

        let gate = ValidationGate::new(GateParts {
            store,
            backend,
            fallback,
            scorer,
            emergency,
            overrides,
            registry,
            audit,
            fail_safe: config.fail_safe,
            backend_timeout: config.backend_timeout(),
        });

        Ok(Self { config, gate })
    }
}
