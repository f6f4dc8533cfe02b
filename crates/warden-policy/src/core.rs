// core.rs: The non-overridable core bundle.
//
// The core bundle is the floor every decision stands on: self-replication,
// policy tampering, system access, sensitive-file access and unauthorized
// network access are denied no matter what any other source says.
//
// It lives on disk at `<policy_root>/core/core.policy.yaml` with a mandatory
// `.sha256` sidecar, so operators can read it, but the binary carries the
// authoritative copy. At startup the on-disk copy is validated:
//
//   1. the sidecar exists and matches the content;
//   2. the namespace is `core`;
//   3. every reserved deny rule is present and identical to the embedded one;
//   4. the baseline allow rules are present.
//
// Any failure regenerates the file from the embedded copy. If the
// regenerated file still fails validation (read-only disk, a process racing
// us), loading fails with `CoreIntegrity` and the daemon refuses to start.

use std::fs;
use std::path::{Path, PathBuf};

use crate::bundle::{PolicyBundle, RuleEffect};
use crate::error::PolicyError;
use crate::source::{self, PolicyOrigin, PolicySource};

/// Namespace reserved for the core bundle.
pub const CORE_NAMESPACE: &str = "core";

/// Deny rules no other source may redefine.
pub const RESERVED_RULES: &[&str] = &[
    "self_replication_block",
    "policy_modification_block",
    "system_access_block",
    "sensitive_file_block",
    "unauthorized_network_block",
];

/// Baseline allow rules the core bundle must carry.
pub const REQUIRED_ALLOW_RULES: &[&str] = &["agent_communication", "safe_read", "low_risk_write"];

/// Embedded fallback definition of the core bundle.
pub const CORE_BUNDLE: &str = r#"# Warden core policy bundle. Regenerated automatically if modified.
namespace: core
version: "1.0.0"
rules:
  - name: self_replication_block
    effect: deny
    reason: "CRITICAL_VIOLATION: self-replication blocked"
    when:
      actions: [create_agent, spawn_process, replicate, fork, clone]

  - name: policy_modification_block
    effect: deny
    reason: "CRITICAL_VIOLATION: policy modification blocked"
    when:
      actions: [write, delete, modify]
      resource_types: [policy, policy_config, security_config]
      except_agents: [human_operator]

  - name: system_access_block
    effect: deny
    reason: "CRITICAL_VIOLATION: system access blocked"
    when:
      actions: [execute, shell, system]
      resource_types: [system, os, kernel, root]

  - name: sensitive_file_block
    effect: deny
    reason: "CRITICAL_VIOLATION: sensitive file access blocked"
    when:
      actions: [read, write, delete]
      resource_types: [system_config, credentials, keys, certificates]
      except_agents: [authorized_system_agent]

  - name: unauthorized_network_block
    effect: deny
    reason: "CRITICAL_VIOLATION: unauthorized network access"
    when:
      actions: [network_request]
      unless_metadata:
        destination:
          - localhost
          - 127.0.0.1
          - warden
          - semantic-layer
          - orchestrator
          - planner
          - actor
          - observer

  - name: agent_communication
    effect: allow
    reason: communication between registered agents
    when:
      actions: [agent_communication]
      source_agents: [orchestrator, planner, actor, observer, warden, semantic_layer]
      target_agents: [orchestrator, planner, actor, observer, warden, semantic_layer]
      content_clean: true

  - name: safe_read
    effect: allow
    reason: low-risk read of a safe resource
    when:
      actions: [read]
      resource_types: [document, agent_card, public_config, log, cache, temp_file]
      content_clean: true
      max_risk: 0.5

  - name: low_risk_write
    effect: allow
    reason: low-risk write to scratch storage
    when:
      actions: [write]
      resource_types: [temp_file, log, cache]
      content_clean: true
      max_risk: 0.3
"#;

/// Path of the on-disk core bundle under a policy root.
pub fn core_path(policy_root: &Path) -> PathBuf {
    policy_root.join("core").join("core.policy.yaml")
}

/// Check a loaded core source against the embedded definition.
pub fn validate_core(source: &PolicySource) -> Result<(), String> {
    if source.namespace != CORE_NAMESPACE {
        return Err(format!(
            "namespace is '{}', expected '{}'",
            source.namespace, CORE_NAMESPACE
        ));
    }
    let embedded = PolicyBundle::parse(CORE_BUNDLE)?;
    for name in RESERVED_RULES {
        let reference = embedded
            .rule(name)
            .ok_or_else(|| format!("embedded core bundle lacks '{}'", name))?;
        match source.rules.iter().find(|r| r.name == *name) {
            None => return Err(format!("reserved rule '{}' is missing", name)),
            Some(rule) if rule.effect != RuleEffect::Deny => {
                return Err(format!("reserved rule '{}' is not a deny rule", name))
            }
            Some(rule) if rule != reference => {
                return Err(format!("reserved rule '{}' was altered", name))
            }
            Some(_) => {}
        }
    }
    for name in REQUIRED_ALLOW_RULES {
        if !source.rules.iter().any(|r| r.name == *name) {
            return Err(format!("baseline rule '{}' is missing", name));
        }
    }
    Ok(())
}

/// Load the core bundle, regenerating it from the embedded copy if it is
/// missing or fails validation.
pub fn ensure_core(policy_root: &Path) -> Result<PolicySource, PolicyError> {
    let path = core_path(policy_root);

    if path.exists() {
        match load_core(&path) {
            Ok(source) => return Ok(source),
            Err(reason) => {
                tracing::error!(
                    path = %path.display(),
                    reason = %reason,
                    "core policy bundle failed validation; regenerating from embedded copy"
                );
            }
        }
    } else {
        tracing::info!(path = %path.display(), "writing core policy bundle");
    }

    write_core(&path).map_err(|e| PolicyError::CoreIntegrity {
        path: path.clone(),
        reason: format!("regeneration failed: {}", e),
    })?;
    load_core(&path).map_err(|reason| PolicyError::CoreIntegrity {
        path: path.clone(),
        reason: format!("regenerated bundle still invalid: {}", reason),
    })
}

/// Validate the core bundle without regenerating it.
pub fn check_core(policy_root: &Path) -> Result<PolicySource, PolicyError> {
    let path = core_path(policy_root);
    load_core(&path).map_err(|reason| PolicyError::CoreIntegrity { path, reason })
}

fn load_core(path: &Path) -> Result<PolicySource, String> {
    if source::read_sidecar(path)
        .map_err(|e| e.to_string())?
        .is_none()
    {
        return Err("checksum sidecar is missing".into());
    }
    let source = PolicySource::from_file(PolicyOrigin::Core, path).map_err(|e| e.to_string())?;
    validate_core(&source)?;
    Ok(source)
}

fn write_core(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, CORE_BUNDLE)?;
    source::write_sidecar(path, CORE_BUNDLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn embedded_bundle_is_valid() {
        let source =
            PolicySource::from_raw(PolicyOrigin::Core, "embedded", None, CORE_BUNDLE.into())
                .unwrap();
        validate_core(&source).unwrap();
        assert!(source.is_core);
        assert_eq!(source.priority, 1000);
    }

    #[test]
    fn first_run_writes_bundle_and_sidecar() {
        let dir = tempdir().unwrap();
        let source = ensure_core(dir.path()).unwrap();
        let path = core_path(dir.path());
        assert!(path.exists());
        assert!(source::sidecar_path(&path).exists());
        assert_eq!(source.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn corrupted_bundle_is_regenerated() {
        let dir = tempdir().unwrap();
        ensure_core(dir.path()).unwrap();
        let path = core_path(dir.path());
        fs::write(&path, "namespace: core\nrules: []\n").unwrap();

        assert!(check_core(dir.path()).is_err());
        let source = ensure_core(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), CORE_BUNDLE);
        assert_eq!(source.checksum, source::checksum(CORE_BUNDLE));
    }

    #[test]
    fn loosened_rule_with_resigned_sidecar_is_rejected() {
        let dir = tempdir().unwrap();
        ensure_core(dir.path()).unwrap();
        let path = core_path(dir.path());
        let loosened = CORE_BUNDLE.replace("fork, clone", "fork");
        fs::write(&path, &loosened).unwrap();
        source::write_sidecar(&path, &loosened).unwrap();

        let err = check_core(dir.path()).unwrap_err();
        assert!(err.to_string().contains("altered"));
    }

    #[test]
    fn missing_sidecar_is_rejected() {
        let dir = tempdir().unwrap();
        ensure_core(dir.path()).unwrap();
        fs::remove_file(source::sidecar_path(&core_path(dir.path()))).unwrap();
        assert!(check_core(dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_root_fails_closed() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let core_dir = dir.path().join("core");
        fs::create_dir_all(&core_dir).unwrap();
        fs::write(core_path(dir.path()), "garbage: [").unwrap();
        fs::set_permissions(&core_dir, fs::Permissions::from_mode(0o500)).unwrap();

        let result = ensure_core(dir.path());
        fs::set_permissions(&core_dir, fs::Permissions::from_mode(0o700)).unwrap();

        // Running as root ignores directory permissions; only assert when the
        // write was actually refused.
        if let Err(err) = result {
            assert!(matches!(err, PolicyError::CoreIntegrity { .. }));
        }
    }
}
