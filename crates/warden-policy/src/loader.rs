// loader.rs: Policy Source Loader.
//
// Reads bundles from every origin in priority order and hands them to the
// merge resolver:
//
//   core              <policy_root>/core/core.policy.yaml (validated or regenerated)
//   built-in          compiled into the binary
//   environment path  every directory in WARDEN_POLICY_PATH
//   project-local     <policy_root>/local/
//   installed package every subdirectory of <policy_root>/packages/
//
// Inside a directory, bundles are discovered with the glob `*.policy.yaml`
// and loaded in file-name order. A non-core bundle that fails to load is
// skipped: logged, listed in `PolicySet::skipped`, never fatal.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core;
use crate::error::PolicyError;
use crate::set::{PolicySet, SkippedSource};
use crate::source::{self, PolicyOrigin, PolicySource};

/// Glob used to discover bundle files inside a source directory.
pub const BUNDLE_GLOB: &str = "*.policy.yaml";

/// Where to look for policy bundles.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Root of the policy tree (`.warden/policies`).
    pub policy_root: PathBuf,
    /// Extra directories at environment-path priority.
    pub environment_paths: Vec<PathBuf>,
    /// Include the compiled-in bundles.
    pub builtin: bool,
}

impl LoaderConfig {
    pub fn new(policy_root: impl Into<PathBuf>) -> Self {
        Self {
            policy_root: policy_root.into(),
            environment_paths: Vec::new(),
            builtin: true,
        }
    }

    pub fn with_environment_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.environment_paths = paths;
        self
    }

    pub fn without_builtin(mut self) -> Self {
        self.builtin = false;
        self
    }

    pub fn local_dir(&self) -> PathBuf {
        self.policy_root.join("local")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.policy_root.join("packages")
    }
}

/// Loads sources and builds policy sets.
#[derive(Debug, Clone)]
pub struct PolicyLoader {
    config: LoaderConfig,
}

impl PolicyLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load every source and build a set. Regenerates the core bundle when
    /// needed; fails only when core cannot be established.
    pub fn load(&self, generation: u64) -> Result<PolicySet, PolicyError> {
        let core = core::ensure_core(&self.config.policy_root)?;
        self.build(core, generation)
    }

    /// Validate every source without writing anything. The core bundle is
    /// checked as-is, so a corrupt core is reported instead of repaired.
    pub fn check(&self) -> Result<PolicySet, PolicyError> {
        let core = core::check_core(&self.config.policy_root)?;
        self.build(core, 0)
    }

    fn build(&self, core: PolicySource, generation: u64) -> Result<PolicySet, PolicyError> {
        let mut sources = vec![core];
        let mut skipped = Vec::new();

        let mut accept = |result: Result<PolicySource, PolicyError>, origin: PolicyOrigin| {
            match result {
                Ok(source) => sources.push(source),
                Err(err) => {
                    let (location, reason) = match &err {
                        PolicyError::Source {
                            location, reason, ..
                        } => (location.clone(), reason.clone()),
                        other => (String::from("<unknown>"), other.to_string()),
                    };
                    tracing::warn!(%origin, %location, %reason, "skipping policy source");
                    skipped.push(SkippedSource {
                        origin,
                        location,
                        reason,
                    });
                }
            }
        };

        if self.config.builtin {
            for result in source::builtin_sources() {
                accept(result, PolicyOrigin::BuiltIn);
            }
        }
        for dir in &self.config.environment_paths {
            for path in discover(dir) {
                accept(
                    PolicySource::from_file(PolicyOrigin::EnvironmentPath, &path),
                    PolicyOrigin::EnvironmentPath,
                );
            }
        }
        for path in discover(&self.config.local_dir()) {
            accept(
                PolicySource::from_file(PolicyOrigin::ProjectLocal, &path),
                PolicyOrigin::ProjectLocal,
            );
        }
        for package in package_dirs(&self.config.packages_dir()) {
            for path in discover(&package) {
                accept(
                    PolicySource::from_file(PolicyOrigin::InstalledPackage, &path),
                    PolicyOrigin::InstalledPackage,
                );
            }
        }

        let set = PolicySet::build(sources, skipped, generation)?;
        tracing::info!(
            generation,
            sources = set.sources.len(),
            rules = set.rules.len(),
            skipped = set.skipped.len(),
            conflicts = set.conflicts.len(),
            "policy set built"
        );
        Ok(set)
    }
}

/// Bundle files directly inside `dir`, sorted by name. A missing directory
/// has no bundles.
pub fn discover(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let Some(dir_str) = dir.to_str() else {
        tracing::warn!(dir = %dir.display(), "policy directory path is not UTF-8; skipping");
        return Vec::new();
    };
    let pattern = format!("{}/{}", glob::Pattern::escape(dir_str), BUNDLE_GLOB);
    let mut paths: Vec<PathBuf> = match glob::glob(&pattern) {
        Ok(entries) => entries.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "invalid policy glob");
            Vec::new()
        }
    };
    paths.sort();
    paths
}

fn package_dirs(packages: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(packages) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Split an OS path list (`WARDEN_POLICY_PATH`) into directories.
pub fn split_policy_path(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}
