// policies.rs: Policy subcommands (status, check).
//
// Both validate sources without touching disk: a corrupt core bundle is
// reported here rather than regenerated, which only the daemon does.

use clap::Subcommand;
use warden_gate::GateConfig;
use warden_policy::{PolicyLoader, PolicySetSummary};

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// List the policy sources that would be loaded, in priority order.
    Status {
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate every source; fails on skipped sources or core conflicts.
    Check,
}

pub fn execute(cmd: &PolicyCommands, config: &GateConfig) -> anyhow::Result<()> {
    let summary = load_summary(config)?;
    match cmd {
        PolicyCommands::Status { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            println!(
                "{} rule(s), {} from core, fingerprint {}",
                summary.rule_count,
                summary.core_rule_count,
                short(&summary.fingerprint)
            );
            println!();
            println!(
                "{:<18} {:<9} {:<16} {:<6} LOCATION",
                "ORIGIN", "PRIORITY", "NAMESPACE", "RULES"
            );
            println!("{}", "-".repeat(80));
            for source in &summary.sources {
                println!(
                    "{:<18} {:<9} {:<16} {:<6} {}",
                    source.origin.to_string(),
                    source.priority,
                    source.namespace,
                    source.rules,
                    source.location
                );
            }
            Ok(())
        }

        PolicyCommands::Check => {
            let problems = report(&summary);
            for line in &problems {
                println!("{}", line);
            }
            for s in &summary.shadowings {
                println!(
                    "note: {}.{} from {} shadows {}",
                    s.namespace, s.rule, s.winner, s.loser
                );
            }
            if !problems.is_empty() {
                anyhow::bail!("{} policy problem(s) found", problems.len());
            }
            println!(
                "Policies OK: {} source(s), {} rule(s).",
                summary.sources.len(),
                summary.rule_count
            );
            Ok(())
        }
    }
}

fn load_summary(config: &GateConfig) -> anyhow::Result<PolicySetSummary> {
    let set = PolicyLoader::new(config.loader_config()).check()?;
    Ok(set.summary())
}

/// Problems that make `check` fail.
fn report(summary: &PolicySetSummary) -> Vec<String> {
    let mut problems = Vec::new();
    for skipped in &summary.skipped {
        problems.push(format!(
            "skipped {} source {}: {}",
            skipped.origin, skipped.location, skipped.reason
        ));
    }
    for conflict in &summary.conflicts {
        problems.push(format!(
            "conflict ({:?}): {}.{} in {} ignored; core wins",
            conflict.kind, conflict.namespace, conflict.rule, conflict.location
        ));
    }
    problems
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_with_local(dir: &TempDir, name: &str, body: &str) -> GateConfig {
        let config = GateConfig::for_project(dir.path());
        let local = config.loader_config().local_dir();
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join(name), body).unwrap();
        config
    }

    #[test]
    fn clean_project_has_no_problems() {
        let dir = TempDir::new().unwrap();
        let config = config_with_local(
            &dir,
            "team.policy.yaml",
            "namespace: team\nrules:\n  - name: allow_read\n    effect: allow\n    when:\n      actions: [read]\n",
        );
        // The core bundle is written on first load by the daemon.
        PolicyLoader::new(config.loader_config()).load(1).unwrap();

        let summary = load_summary(&config).unwrap();
        assert!(report(&summary).is_empty());
        assert!(summary.sources.iter().any(|s| s.namespace == "team"));
    }

    #[test]
    fn malformed_source_is_a_problem() {
        let dir = TempDir::new().unwrap();
        let config = config_with_local(&dir, "broken.policy.yaml", "rules: [[[");
        PolicyLoader::new(config.loader_config()).load(1).unwrap();

        let summary = load_summary(&config).unwrap();
        let problems = report(&summary);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("skipped project_local"));
    }

    #[test]
    fn short_fingerprint() {
        assert_eq!(short("abcdef0123456789"), "abcdef012345");
        assert_eq!(short("abc"), "abc");
    }
}
