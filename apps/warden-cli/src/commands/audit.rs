// audit.rs: Audit subcommands (verify, tail).
//
// Both work offline against the log on disk. `verify` needs only the
// published public key, so it can run on a machine that never held the
// private signing key.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use warden_audit::{public_key_path, AuditLog, IntegrityReport, PublicKeyVerifier, RecordKind};
use warden_gate::GateConfig;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Verify the hash chain and every signature in the audit log.
    Verify {
        /// Path to audit log (defaults to .warden/audit.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Public key file (defaults to the signing key's .pub file).
        #[arg(long)]
        key: Option<PathBuf>,
    },
    /// Show recent audit records.
    Tail {
        /// Path to audit log (defaults to .warden/audit.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Number of records to show.
        #[arg(short, default_value = "10")]
        n: usize,
        /// Only show records of this kind (decision, emergency_event, override, policy_reload).
        #[arg(long)]
        kind: Option<String>,
    },
}

pub fn execute(cmd: &AuditCommands, config: &GateConfig) -> anyhow::Result<()> {
    match cmd {
        AuditCommands::Verify { log, key } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log.clone());
            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }
            let key = key
                .clone()
                .unwrap_or_else(|| public_key_path(&config.signing_key));

            let report = verify(&path, &key)?;
            if report.valid {
                println!(
                    "Audit log verified: {} record(s), chain and signatures intact (key {}).",
                    report.records_checked, report.key_id
                );
                if let Some(seq) = report.anchored_at {
                    println!("Chain resumes from retention anchor at sequence {}.", seq);
                }
                return Ok(());
            }

            if let Some(brk) = &report.first_break {
                println!("INTEGRITY VIOLATION at line {}: {}", brk.index + 1, brk.kind);
                if let Some(seq) = brk.sequence {
                    println!("  Sequence: {}", seq);
                }
                if let Some(expected) = &brk.expected {
                    println!("  Expected: {}", expected);
                }
                if let Some(actual) = &brk.actual {
                    println!("  Actual:   {}", actual);
                }
            }
            println!();
            println!("The audit log may have been tampered with.");
            anyhow::bail!("Audit log integrity check failed");
        }

        AuditCommands::Tail { log, n, kind } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log.clone());
            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }
            let filter = kind.as_deref().map(parse_kind).transpose()?;

            let records = AuditLog::read_all(&path)?;
            let matching: Vec<_> = records
                .iter()
                .filter(|r| filter.map_or(true, |k| r.kind == k))
                .collect();
            let start = matching.len().saturating_sub(*n);
            let recent = &matching[start..];

            if recent.is_empty() {
                println!("No audit records.");
                return Ok(());
            }

            println!(
                "{:<8} {:<20} {:<16} SUMMARY",
                "SEQ", "TIMESTAMP", "KIND"
            );
            println!("{}", "-".repeat(80));
            for record in recent {
                println!(
                    "{:<8} {:<20} {:<16} {}",
                    record.sequence,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.kind.to_string(),
                    summarize(record.kind, &record.payload),
                );
            }
        }
    }

    Ok(())
}

/// Validate the log at `path` against the public key at `key`.
pub fn verify(path: &Path, key: &Path) -> anyhow::Result<IntegrityReport> {
    let verifier = PublicKeyVerifier::from_file(key)?;
    Ok(warden_audit::validate_integrity(path, &verifier)?)
}

fn parse_kind(value: &str) -> anyhow::Result<RecordKind> {
    match value {
        "decision" => Ok(RecordKind::Decision),
        "emergency_event" | "emergency" => Ok(RecordKind::EmergencyEvent),
        "override" => Ok(RecordKind::Override),
        "policy_reload" | "reload" => Ok(RecordKind::PolicyReload),
        other => anyhow::bail!("unknown record kind '{}'", other),
    }
}

/// One-line description of a record payload.
fn summarize(kind: RecordKind, payload: &serde_json::Value) -> String {
    let field = |name: &str| payload.get(name).and_then(|v| v.as_str()).unwrap_or("-");
    match kind {
        RecordKind::Decision => {
            let verdict = if payload.get("allow").and_then(|v| v.as_bool()) == Some(true) {
                "ALLOW"
            } else {
                "DENY"
            };
            format!(
                "{} {} {}/{}",
                verdict,
                field("source_agent"),
                field("action"),
                field("resource_type")
            )
        }
        RecordKind::EmergencyEvent => format!(
            "{} -> {} by {}: {}",
            field("from_state"),
            field("to_state"),
            field("initiated_by"),
            field("reason")
        ),
        RecordKind::Override => {
            let admin = payload
                .pointer("/request/admin_id")
                .and_then(|v| v.as_str())
                .unwrap_or("-");
            format!("{} by {}", field("override_id"), admin)
        }
        RecordKind::PolicyReload => format!(
            "{} generation {}",
            field("status"),
            payload
                .get("generation")
                .map(|g| g.to_string())
                .unwrap_or_else(|| "-".into())
        ),
    }
}
