// state.rs: Persisted system state, read from the audit log.
//
// Works without a running daemon. Events whose signature does not verify
// are listed but never decide the state.

use std::path::Path;

use chrono::Utc;
use clap::Subcommand;
use warden_audit::{public_key_path, AuditLog, PublicKeyVerifier};
use warden_gate::{events_from_records, EmergencyEvent, GateConfig, SystemStateKind};

#[derive(Subcommand)]
pub enum StateCommands {
    /// Show the state a daemon would resume in.
    Show,
    /// List recent state transitions, newest first.
    History {
        /// Number of events to show.
        #[arg(short, default_value = "20")]
        n: usize,
    },
}

pub fn execute(cmd: &StateCommands, config: &GateConfig) -> anyhow::Result<()> {
    let events = load_events(&config.audit_log, &public_key_path(&config.signing_key))?;
    match cmd {
        StateCommands::Show => {
            let Some((event, _)) = events.iter().rev().find(|(_, verified)| *verified) else {
                println!("NORMAL (no recorded transitions)");
                return Ok(());
            };
            println!("{}", resume_state(event));
            println!("  since:        {}", event.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("  reason:       {}", event.reason);
            println!("  initiated by: {}", event.initiated_by);
            if let Some(expires) = event.expires_at {
                println!("  expires:      {}", expires.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if event.to_state == SystemStateKind::Shutdown {
                println!();
                println!("Restart requires `warden serve --acknowledge-shutdown`.");
            }
        }

        StateCommands::History { n } => {
            if events.is_empty() {
                println!("No recorded transitions.");
                return Ok(());
            }
            println!(
                "{:<20} {:<15} {:<15} {:<16} REASON",
                "TIMESTAMP", "FROM", "TO", "BY"
            );
            println!("{}", "-".repeat(80));
            for (event, verified) in events.iter().rev().take(*n) {
                println!(
                    "{:<20} {:<15} {:<15} {:<16} {}{}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.from_state.to_string(),
                    event.to_state.to_string(),
                    event.initiated_by,
                    event.reason,
                    if *verified { "" } else { "  [BAD SIGNATURE]" }
                );
            }
        }
    }
    Ok(())
}

/// Emergency events in log order, each paired with whether its signature
/// verifies under the public key at `key`.
fn load_events(log: &Path, key: &Path) -> anyhow::Result<Vec<(EmergencyEvent, bool)>> {
    if !log.exists() {
        return Ok(Vec::new());
    }
    let records = AuditLog::read_all(log)?;
    let events = events_from_records(&records);
    if events.is_empty() {
        return Ok(Vec::new());
    }
    let verifier = PublicKeyVerifier::from_file(key)?;
    Ok(events
        .into_iter()
        .map(|e| {
            let ok = e.verify(&verifier);
            (e, ok)
        })
        .collect())
}

fn resume_state(event: &EmergencyEvent) -> String {
    match (event.to_state, event.expires_at) {
        (SystemStateKind::EmergencyMode | SystemStateKind::Maintenance, Some(at))
            if at <= Utc::now() =>
        {
            format!("NORMAL ({} window expired)", event.to_state)
        }
        (state, _) => state.to_string(),
    }
}
