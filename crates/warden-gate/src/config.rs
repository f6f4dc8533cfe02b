// config.rs: Gate configuration.
//
// GateConfig determines where Warden keeps its state and how the gate
// behaves when things go wrong. `for_project()` lays out the standard
// `.warden/` directory:
//
//   .warden/
//     policies/{core,local,packages}/
//     audit.jsonl (+ audit.jsonl.anchor after retention pruning)
//     keys/audit_signing.pk8 (+ .pub)
//     warden.toml
//
// `load()` starts from those defaults, overlays `warden.toml`, then
// overlays `WARDEN_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use warden_policy::{LoaderConfig, RiskConfig};

use crate::error::GateError;

/// What to do when the evaluation backend cannot give an answer.
///
/// No mode ever turns a failed evaluation into an allow: `warn` and
/// `allow` fall back to the in-process interpreter over the same merged
/// policy set, `deny` answers with a fail-safe deny straight away.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailSafeMode {
    #[default]
    Deny,
    Warn,
    Allow,
}

impl FromStr for FailSafeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(FailSafeMode::Deny),
            "warn" => Ok(FailSafeMode::Warn),
            "allow" => Ok(FailSafeMode::Allow),
            other => Err(format!("unknown fail-safe mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for FailSafeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailSafeMode::Deny => "deny",
            FailSafeMode::Warn => "warn",
            FailSafeMode::Allow => "allow",
        };
        write!(f, "{}", s)
    }
}

/// Full gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Root directory of the project.
    pub project_root: PathBuf,

    /// `.warden/` under the project root.
    pub warden_dir: PathBuf,

    /// Root of the policy tree.
    pub policy_root: PathBuf,

    /// Extra policy directories at environment-path priority.
    pub environment_policy_paths: Vec<PathBuf>,

    /// Path to the append-only audit log.
    pub audit_log: PathBuf,

    /// PKCS#8 signing key. May live outside `.warden/`.
    pub signing_key: PathBuf,

    /// Records older than this are pruned at startup. `None` keeps everything.
    pub audit_retention_days: Option<u32>,

    pub audit_queue_capacity: usize,
    pub audit_backpressure_ms: u64,

    pub fail_safe: FailSafeMode,

    /// External evaluator endpoint. `None` evaluates in-process.
    pub backend_url: Option<String>,
    pub backend_timeout_ms: u64,

    /// Total budget for shutdown callbacks.
    pub shutdown_callback_timeout_ms: u64,

    /// Address the daemon binds to.
    pub bind: String,

    pub risk: RiskConfig,
}

impl GateConfig {
    /// Create a config with the standard `.warden/` layout for a project.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref().to_path_buf();
        let warden_dir = root.join(".warden");
        Self {
            project_root: root,
            policy_root: warden_dir.join("policies"),
            environment_policy_paths: Vec::new(),
            audit_log: warden_dir.join("audit.jsonl"),
            signing_key: warden_dir.join("keys").join("audit_signing.pk8"),
            audit_retention_days: None,
            audit_queue_capacity: 1024,
            audit_backpressure_ms: 500,
            fail_safe: FailSafeMode::Deny,
            backend_url: None,
            backend_timeout_ms: 250,
            shutdown_callback_timeout_ms: 5_000,
            bind: "127.0.0.1:8787".to_string(),
            risk: RiskConfig::default(),
            warden_dir,
        }
    }

    /// Defaults, then `warden.toml`, then the process environment.
    pub fn load(project_root: impl AsRef<Path>) -> Result<Self, GateError> {
        let mut config = Self::for_project(project_root);
        let file = config.config_file();
        if file.exists() {
            let text = std::fs::read_to_string(&file).map_err(|source| GateError::Io {
                path: file.clone(),
                source,
            })?;
            config.apply_toml(&text, &file.display().to_string())?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), GateError> {
        self.risk.check().map_err(|reason| GateError::Config {
            source_name: "risk".to_string(),
            reason,
        })?;
        if let Some(days) = self.audit_retention_days {
            let horizon = TimeDelta::try_days(i64::from(days))
                .and_then(|age| Utc::now().checked_sub_signed(age));
            if horizon.is_none() {
                return Err(GateError::Config {
                    source_name: "audit.retention_days".to_string(),
                    reason: format!("{} days is out of range", days),
                });
            }
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.warden_dir.join("warden.toml")
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn shutdown_callback_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_callback_timeout_ms)
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig::new(&self.policy_root)
            .with_environment_paths(self.environment_policy_paths.clone())
    }

    pub fn trail_options(&self) -> warden_audit::TrailOptions {
        warden_audit::TrailOptions {
            capacity: self.audit_queue_capacity,
            backpressure_timeout: Duration::from_millis(self.audit_backpressure_ms),
        }
    }

    /// Overlay a `warden.toml` document.
    pub fn apply_toml(&mut self, text: &str, source_name: &str) -> Result<(), GateError> {
        let file: WardenToml = toml::from_str(text).map_err(|e| GateError::Config {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(gate) = file.gate {
            if let Some(mode) = gate.fail_safe_mode {
                self.fail_safe = mode;
            }
            if gate.backend_url.is_some() {
                self.backend_url = gate.backend_url;
            }
            if let Some(ms) = gate.backend_timeout_ms {
                self.backend_timeout_ms = ms;
            }
            if let Some(ms) = gate.shutdown_callback_timeout_ms {
                self.shutdown_callback_timeout_ms = ms;
            }
        }
        if let Some(audit) = file.audit {
            if audit.retention_days.is_some() {
                self.audit_retention_days = audit.retention_days;
            }
            if let Some(path) = audit.signing_key {
                self.signing_key = self.resolve(path);
            }
            if let Some(capacity) = audit.queue_capacity {
                self.audit_queue_capacity = capacity;
            }
            if let Some(ms) = audit.backpressure_ms {
                self.audit_backpressure_ms = ms;
            }
        }
        if let Some(policies) = file.policies {
            let resolved: Vec<PathBuf> =
                policies.paths.into_iter().map(|p| self.resolve(p)).collect();
            self.environment_policy_paths.extend(resolved);
        }
        if let Some(server) = file.server {
            if let Some(bind) = server.bind {
                self.bind = bind;
            }
        }
        if let Some(risk) = file.risk {
            risk.check().map_err(|reason| GateError::Config {
                source_name: source_name.to_string(),
                reason,
            })?;
            self.risk = risk;
        }
        Ok(())
    }

    /// Overlay `WARDEN_*` variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), GateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn invalid(key: &str, reason: impl ToString) -> GateError {
            GateError::Config {
                source_name: key.to_string(),
                reason: reason.to_string(),
            }
        }

        if let Some(v) = lookup("WARDEN_FAIL_SAFE_MODE") {
            self.fail_safe = v
                .parse()
                .map_err(|e: String| invalid("WARDEN_FAIL_SAFE_MODE", e))?;
        }
        if let Some(v) = lookup("WARDEN_POLICY_PATH") {
            self.environment_policy_paths
                .extend(warden_policy::loader::split_policy_path(&v));
        }
        if let Some(v) = lookup("WARDEN_BACKEND_URL") {
            self.backend_url = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = lookup("WARDEN_BACKEND_TIMEOUT_MS") {
            self.backend_timeout_ms = v
                .trim()
                .parse()
                .map_err(|e| invalid("WARDEN_BACKEND_TIMEOUT_MS", e))?;
        }
        if let Some(v) = lookup("WARDEN_AUDIT_RETENTION_DAYS") {
            self.audit_retention_days = Some(
                v.trim()
                    .parse()
                    .map_err(|e| invalid("WARDEN_AUDIT_RETENTION_DAYS", e))?,
            );
        }
        if let Some(v) = lookup("WARDEN_SIGNING_KEY_PATH") {
            self.signing_key = self.resolve(PathBuf::from(v));
        }
        if let Some(v) = lookup("WARDEN_HIGH_RISK_THRESHOLD") {
            let threshold: f64 = v
                .trim()
                .parse()
                .map_err(|e| invalid("WARDEN_HIGH_RISK_THRESHOLD", e))?;
            let mut risk = self.risk.clone();
            risk.high_risk_threshold = threshold;
            risk.check()
                .map_err(|e| invalid("WARDEN_HIGH_RISK_THRESHOLD", e))?;
            self.risk = risk;
        }
        if let Some(v) = lookup("WARDEN_BIND") {
            self.bind = v;
        }
        Ok(())
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.project_root.join(path)
        }
    }
}

// ── warden.toml ──

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WardenToml {
    gate: Option<GateSection>,
    audit: Option<AuditSection>,
    policies: Option<PoliciesSection>,
    server: Option<ServerSection>,
    risk: Option<RiskConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct GateSection {
    fail_safe_mode: Option<FailSafeMode>,
    backend_url: Option<String>,
    backend_timeout_ms: Option<u64>,
    shutdown_callback_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditSection {
    retention_days: Option<u32>,
    signing_key: Option<PathBuf>,
    queue_capacity: Option<usize>,
    backpressure_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PoliciesSection {
    #[serde(default)]
    paths: Vec<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    bind: Option<String>,
}
