// set.rs: Merge & Conflict Resolver, many sources in and one PolicySet out.
//
// Sources are merged in priority order (highest first, ties keep load
// order). Rules are keyed by `(namespace, rule_name)`:
//
//   - the first rule seen for a key wins; later ones are recorded as
//     shadowed, never silently dropped;
//   - a non-core source may not use the `core` namespace, and may not define
//     a rule whose name is reserved by core in *any* namespace. Such rules
//     are dropped and recorded as conflicts.
//
// A PolicySet is immutable once built. Reloading builds a new one and swaps
// the pointer (see store.rs).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bundle::PolicyRule;
use crate::core::{CORE_NAMESPACE, RESERVED_RULES};
use crate::error::PolicyError;
use crate::source::{PolicyOrigin, PolicySource};

/// A rule in the merged set, with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedRule {
    pub namespace: String,
    #[serde(flatten)]
    pub rule: PolicyRule,
    pub origin: PolicyOrigin,
    pub priority: u32,
    pub location: String,
    pub is_core: bool,
}

impl MergedRule {
    /// `namespace.rule_name`, as listed in `evaluated_policies`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.rule.name)
    }
}

/// Why a rule was refused at merge time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// A non-core source declared the `core` namespace.
    CoreNamespace,
    /// A non-core source defined a rule reserved by core.
    ReservedRuleName,
}

/// A rule that tried to override core. Core always wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConflict {
    pub kind: ConflictKind,
    pub origin: PolicyOrigin,
    pub location: String,
    pub namespace: String,
    pub rule: String,
}

/// A rule that lost to a higher-priority (or earlier) rule with the same key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shadowing {
    pub namespace: String,
    pub rule: String,
    pub winner: String,
    pub winner_priority: u32,
    pub loser: String,
    pub loser_priority: u32,
}

/// A source that failed validation and was left out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedSource {
    pub origin: PolicyOrigin,
    pub location: String,
    pub reason: String,
}

/// The active, immutable policy set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySet {
    pub sources: Vec<PolicySource>,
    pub rules: Vec<MergedRule>,
    pub conflicts: Vec<PolicyConflict>,
    pub shadowings: Vec<Shadowing>,
    pub skipped: Vec<SkippedSource>,
    pub loaded_at: DateTime<Utc>,
    pub generation: u64,
    /// SHA-256 over the ordered source checksums.
    pub fingerprint: String,
}

impl PolicySet {
    /// Merge `sources` into a set. Fails if no core source is present.
    pub fn build(
        mut sources: Vec<PolicySource>,
        skipped: Vec<SkippedSource>,
        generation: u64,
    ) -> Result<Self, PolicyError> {
        if !sources
            .iter()
            .any(|s| s.is_core && s.namespace == CORE_NAMESPACE)
        {
            return Err(PolicyError::NoCoreSource);
        }

        // Stable: equal priorities keep their load order.
        sources.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut rules: Vec<MergedRule> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        let mut conflicts = Vec::new();
        let mut shadowings = Vec::new();

        for source in &sources {
            for rule in &source.rules {
                if !source.is_core {
                    let kind = if source.namespace == CORE_NAMESPACE {
                        Some(ConflictKind::CoreNamespace)
                    } else if RESERVED_RULES.contains(&rule.name.as_str()) {
                        Some(ConflictKind::ReservedRuleName)
                    } else {
                        None
                    };
                    if let Some(kind) = kind {
                        tracing::warn!(
                            location = %source.location,
                            namespace = %source.namespace,
                            rule = %rule.name,
                            ?kind,
                            "policy source tried to override a core rule; core wins"
                        );
                        conflicts.push(PolicyConflict {
                            kind,
                            origin: source.origin,
                            location: source.location.clone(),
                            namespace: source.namespace.clone(),
                            rule: rule.name.clone(),
                        });
                        continue;
                    }
                }

                let key = (source.namespace.clone(), rule.name.clone());
                if let Some(&existing) = index.get(&key) {
                    let winner = &rules[existing];
                    shadowings.push(Shadowing {
                        namespace: source.namespace.clone(),
                        rule: rule.name.clone(),
                        winner: winner.location.clone(),
                        winner_priority: winner.priority,
                        loser: source.location.clone(),
                        loser_priority: source.priority,
                    });
                    continue;
                }
                index.insert(key, rules.len());
                rules.push(MergedRule {
                    namespace: source.namespace.clone(),
                    rule: rule.clone(),
                    origin: source.origin,
                    priority: source.priority,
                    location: source.location.clone(),
                    is_core: source.is_core,
                });
            }
        }

        let mut hasher = Sha256::new();
        for source in &sources {
            hasher.update(source.checksum.as_bytes());
            hasher.update(b"\n");
        }
        let fingerprint = format!("{:x}", hasher.finalize());

        Ok(Self {
            sources,
            rules,
            conflicts,
            shadowings,
            skipped,
            loaded_at: Utc::now(),
            generation,
            fingerprint,
        })
    }

    pub fn rule(&self, namespace: &str, name: &str) -> Option<&MergedRule> {
        self.rules
            .iter()
            .find(|r| r.namespace == namespace && r.rule.name == name)
    }

    pub fn core_rules(&self) -> impl Iterator<Item = &MergedRule> {
        self.rules.iter().filter(|r| r.is_core)
    }

    pub fn custom_rules(&self) -> impl Iterator<Item = &MergedRule> {
        self.rules.iter().filter(|r| !r.is_core)
    }

    pub fn has_core(&self) -> bool {
        self.core_rules().next().is_some()
    }

    /// The merged rules as a JSON document for external evaluators.
    pub fn policy_document(&self) -> serde_json::Value {
        serde_json::json!({
            "generation": self.generation,
            "fingerprint": self.fingerprint,
            "rules": self.rules,
        })
    }

    /// Compact description for status endpoints and the CLI.
    pub fn summary(&self) -> PolicySetSummary {
        PolicySetSummary {
            generation: self.generation,
            fingerprint: self.fingerprint.clone(),
            loaded_at: self.loaded_at,
            core_loaded: self.has_core(),
            rule_count: self.rules.len(),
            core_rule_count: self.core_rules().count(),
            sources: self
                .sources
                .iter()
                .map(|s| SourceSummary {
                    origin: s.origin,
                    priority: s.priority,
                    location: s.location.clone(),
                    namespace: s.namespace.clone(),
                    checksum: s.checksum.clone(),
                    rules: s.rules.len(),
                })
                .collect(),
            conflicts: self.conflicts.clone(),
            shadowings: self.shadowings.clone(),
            skipped: self.skipped.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSummary {
    pub origin: PolicyOrigin,
    pub priority: u32,
    pub location: String,
    pub namespace: String,
    pub checksum: String,
    pub rules: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySetSummary {
    pub generation: u64,
    pub fingerprint: String,
    pub loaded_at: DateTime<Utc>,
    pub core_loaded: bool,
    pub rule_count: usize,
    pub core_rule_count: usize,
    pub sources: Vec<SourceSummary>,
    pub conflicts: Vec<PolicyConflict>,
    pub shadowings: Vec<Shadowing>,
    pub skipped: Vec<SkippedSource>,
}
