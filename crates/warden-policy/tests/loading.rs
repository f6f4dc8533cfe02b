// Integration tests for loading, merging and reloading policy sources.

use std::fs;
use std::path::Path;

use proptest::prelude::*;
use tempfile::tempdir;
use warden_policy::core::{core_path, CORE_BUNDLE, RESERVED_RULES};
use warden_policy::source::write_sidecar;
use warden_policy::{
    ConflictKind, LoaderConfig, PolicyError, PolicyLoader, PolicyOrigin, PolicySet, PolicySource,
    PolicyStore,
};

fn write_bundle(dir: &Path, name: &str, raw: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(name), raw).unwrap();
}

#[test]
fn loads_every_origin_in_priority_order() {
    let root = tempdir().unwrap();
    let env_dir = tempdir().unwrap();
    let policies = root.path().join("policies");

    write_bundle(
        env_dir.path(),
        "env.policy.yaml",
        "namespace: env\nrules:\n  - {name: e, effect: allow}\n",
    );
    write_bundle(
        &policies.join("local"),
        "team.policy.yaml",
        "namespace: team\nrules:\n  - {name: t, effect: allow}\n",
    );
    write_bundle(
        &policies.join("packages").join("acme"),
        "acme.policy.yaml",
        "namespace: acme\nrules:\n  - {name: a, effect: deny}\n",
    );

    let loader = PolicyLoader::new(
        LoaderConfig::new(&policies).with_environment_paths(vec![env_dir.path().to_path_buf()]),
    );
    let set = loader.load(1).unwrap();

    let origins: Vec<_> = set.sources.iter().map(|s| s.origin).collect();
    assert_eq!(
        origins,
        vec![
            PolicyOrigin::Core,
            PolicyOrigin::BuiltIn,
            PolicyOrigin::EnvironmentPath,
            PolicyOrigin::ProjectLocal,
            PolicyOrigin::InstalledPackage,
        ]
    );
    assert!(set.skipped.is_empty());
    assert!(set.rule("acme", "a").is_some());
}

#[test]
fn corrupted_non_core_source_is_skipped() {
    let root = tempdir().unwrap();
    let local = root.path().join("local");
    write_bundle(&local, "good.policy.yaml", "namespace: good\n");
    write_bundle(&local, "broken.policy.yaml", "namespace: [oops");
    let tampered = "namespace: tampered\n";
    write_bundle(&local, "tampered.policy.yaml", tampered);
    write_sidecar(&local.join("tampered.policy.yaml"), "original content").unwrap();

    let set = PolicyLoader::new(LoaderConfig::new(root.path()))
        .load(1)
        .unwrap();

    assert_eq!(set.skipped.len(), 2);
    assert!(set.skipped.iter().all(|s| s.origin == PolicyOrigin::ProjectLocal));
    assert!(set.sources.iter().any(|s| s.namespace == "good"));
    assert!(set.sources.iter().all(|s| s.namespace != "tampered"));
}

#[test]
fn corrupted_core_is_regenerated_on_load() {
    let root = tempdir().unwrap();
    let loader = PolicyLoader::new(LoaderConfig::new(root.path()));
    loader.load(1).unwrap();

    fs::write(core_path(root.path()), "not: [valid").unwrap();
    assert!(matches!(loader.check(), Err(PolicyError::CoreIntegrity { .. })));

    let set = loader.load(2).unwrap();
    assert!(set.rule("core", "self_replication_block").is_some());
    assert_eq!(fs::read_to_string(core_path(root.path())).unwrap(), CORE_BUNDLE);
}

#[test]
fn failed_reload_keeps_previous_set() {
    let root = tempdir().unwrap();
    let store = PolicyStore::open(PolicyLoader::new(LoaderConfig::new(root.path()))).unwrap();
    let before = store.snapshot();

    // Replace the core directory with a plain file so regeneration cannot
    // succeed.
    let core_dir = root.path().join("core");
    fs::remove_dir_all(&core_dir).unwrap();
    fs::write(&core_dir, "blocking file").unwrap();

    let err = store.reload().unwrap_err();
    assert!(matches!(err, PolicyError::CoreIntegrity { .. }));
    assert_eq!(store.snapshot().fingerprint, before.fingerprint);
    assert_eq!(store.snapshot().generation, before.generation);
}

#[test]
fn reserved_rule_override_is_recorded_not_applied() {
    let root = tempdir().unwrap();
    write_bundle(
        &root.path().join("local"),
        "evil.policy.yaml",
        "namespace: team\nrules:\n  - {name: system_access_block, effect: allow}\n",
    );
    let set = PolicyLoader::new(LoaderConfig::new(root.path()))
        .load(1)
        .unwrap();
    assert_eq!(set.conflicts.len(), 1);
    assert_eq!(set.conflicts[0].kind, ConflictKind::ReservedRuleName);
    assert!(set.rule("team", "system_access_block").is_none());
}

fn core_source() -> PolicySource {
    PolicySource::from_raw(PolicyOrigin::Core, "core", None, CORE_BUNDLE.into()).unwrap()
}

fn non_core_origin() -> impl Strategy<Value = PolicyOrigin> {
    prop_oneof![
        Just(PolicyOrigin::BuiltIn),
        Just(PolicyOrigin::EnvironmentPath),
        Just(PolicyOrigin::ProjectLocal),
        Just(PolicyOrigin::InstalledPackage),
    ]
}

fn rule_name() -> impl Strategy<Value = String> {
    let mut names: Vec<String> = RESERVED_RULES.iter().map(|s| s.to_string()).collect();
    names.extend(["safe_read", "agent_communication", "custom_a", "custom_b"].map(String::from));
    proptest::sample::select(names)
}

proptest! {
    #[test]
    fn core_rules_survive_any_merge(
        bundles in proptest::collection::vec(
            (non_core_origin(), prop_oneof![Just("core".to_string()), "ns_[a-z]{1,6}"], proptest::collection::vec((rule_name(), any::<bool>()), 0..6)),
            0..6,
        )
    ) {
        let mut sources = vec![core_source()];
        for (i, (origin, namespace, rules)) in bundles.into_iter().enumerate() {
            let mut raw = format!("namespace: {}\nrules:\n", namespace);
            let mut seen = std::collections::HashSet::new();
            for (name, allow) in rules {
                if seen.insert(name.clone()) {
                    let effect = if allow { "allow" } else { "deny" };
                    raw.push_str(&format!("  - {{name: {}, effect: {}}}\n", name, effect));
                }
            }
            if raw.ends_with("rules:\n") {
                raw.push_str("  []\n");
            }
            sources.push(PolicySource::from_raw(origin, format!("s{}", i), None, raw).unwrap());
        }

        let set = PolicySet::build(sources, vec![], 1).unwrap();
        let core = core_source();
        for rule in &core.rules {
            let merged = set.rule("core", &rule.name);
            prop_assert!(merged.is_some());
            let merged = merged.unwrap();
            prop_assert!(merged.is_core);
            prop_assert_eq!(&merged.rule, rule);
        }
        for reserved in RESERVED_RULES {
            prop_assert!(set.rules.iter().filter(|r| r.rule.name == *reserved).all(|r| r.is_core));
        }
    }
}
