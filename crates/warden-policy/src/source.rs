// source.rs: Where a policy bundle came from and how much it weighs.
//
// A source is one bundle plus its provenance. The origin fixes the priority:
//
//   core (1000) > built-in (400) > environment path (300)
//     > project-local (200) > installed package (100)
//
// A source is checksummed over its raw bytes. If a `<file>.sha256` sidecar
// sits next to the bundle, the checksum must match it; a mismatch means the
// file was corrupted or edited without re-signing the sidecar.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bundle::{PolicyBundle, PolicyRule};
use crate::error::PolicyError;

/// Where a bundle was loaded from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOrigin {
    Core,
    BuiltIn,
    EnvironmentPath,
    ProjectLocal,
    InstalledPackage,
}

impl PolicyOrigin {
    /// Fixed priority; higher wins.
    pub fn priority(self) -> u32 {
        match self {
            PolicyOrigin::Core => 1000,
            PolicyOrigin::BuiltIn => 400,
            PolicyOrigin::EnvironmentPath => 300,
            PolicyOrigin::ProjectLocal => 200,
            PolicyOrigin::InstalledPackage => 100,
        }
    }
}

impl std::fmt::Display for PolicyOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyOrigin::Core => "core",
            PolicyOrigin::BuiltIn => "built_in",
            PolicyOrigin::EnvironmentPath => "environment_path",
            PolicyOrigin::ProjectLocal => "project_local",
            PolicyOrigin::InstalledPackage => "installed_package",
        };
        write!(f, "{}", s)
    }
}

/// One loaded, validated bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySource {
    pub origin: PolicyOrigin,
    pub priority: u32,
    /// File the bundle was read from; `None` for embedded bundles.
    pub path: Option<PathBuf>,
    /// Human-readable location (path or `builtin:<name>`).
    pub location: String,
    #[serde(skip_serializing, default)]
    pub raw_content: String,
    /// Lowercase hex SHA-256 of `raw_content`.
    pub checksum: String,
    pub is_core: bool,
    pub namespace: String,
    pub version: Option<String>,
    pub rules: Vec<PolicyRule>,
}

impl PolicySource {
    /// Build a source from raw bundle text.
    pub fn from_raw(
        origin: PolicyOrigin,
        location: impl Into<String>,
        path: Option<PathBuf>,
        raw_content: String,
    ) -> Result<Self, PolicyError> {
        let location = location.into();
        let bundle = PolicyBundle::parse(&raw_content).map_err(|reason| PolicyError::Source {
            origin,
            location: location.clone(),
            reason,
        })?;
        Ok(Self {
            origin,
            priority: origin.priority(),
            path,
            location,
            checksum: checksum(&raw_content),
            raw_content,
            is_core: origin == PolicyOrigin::Core,
            namespace: bundle.namespace,
            version: bundle.version,
            rules: bundle.rules,
        })
    }

    /// Read a bundle file, honouring its checksum sidecar if present.
    pub fn from_file(origin: PolicyOrigin, path: &Path) -> Result<Self, PolicyError> {
        let location = path.display().to_string();
        let reject = |reason: String| PolicyError::Source {
            origin,
            location: location.clone(),
            reason,
        };

        let raw = fs::read_to_string(path).map_err(|e| reject(e.to_string()))?;
        if let Some(expected) = read_sidecar(path).map_err(|e| reject(e.to_string()))? {
            let actual = checksum(&raw);
            if expected != actual {
                return Err(reject(format!(
                    "checksum mismatch (sidecar {}, content {})",
                    short(&expected),
                    short(&actual)
                )));
            }
        }
        Self::from_raw(origin, location.clone(), Some(path.to_path_buf()), raw)
    }
}

/// Lowercase hex SHA-256 of bundle text.
pub fn checksum(raw: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// `<bundle>.sha256` next to a bundle file.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Read the expected checksum (first whitespace-separated token), if any.
pub fn read_sidecar(path: &Path) -> std::io::Result<Option<String>> {
    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(sidecar)?;
    Ok(text
        .split_whitespace()
        .next()
        .map(|s| s.to_ascii_lowercase()))
}

/// Write `<bundle>.sha256` for `raw`.
pub fn write_sidecar(path: &Path, raw: &str) -> std::io::Result<()> {
    fs::write(sidecar_path(path), format!("{}\n", checksum(raw)))
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

// ── Built-in bundles ──

/// Bundles compiled into the binary at built-in priority.
pub const BUILTIN_BUNDLES: &[(&str, &str)] = &[("observability", BUILTIN_OBSERVABILITY)];

const BUILTIN_OBSERVABILITY: &str = r#"namespace: builtin.observability
version: "1.0.0"
rules:
  - name: observer_log_read
    effect: allow
    reason: observers may read logs and caches
    when:
      actions: [read]
      resource_types: [log, cache]
      source_agents: [observer]
  - name: report_publish
    effect: allow
    reason: observers may publish reports to the orchestrator
    when:
      actions: [agent_communication]
      source_agents: [observer]
      target_agents: [orchestrator]
      content_clean: true
"#;

/// Load every built-in bundle.
pub fn builtin_sources() -> Vec<Result<PolicySource, PolicyError>> {
    BUILTIN_BUNDLES
        .iter()
        .map(|(name, raw)| {
            PolicySource::from_raw(
                PolicyOrigin::BuiltIn,
                format!("builtin:{}", name),
                None,
                raw.to_string(),
            )
        })
        .collect()
}
