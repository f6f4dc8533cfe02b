//! # warden-cli
//!
//! Operator command-line interface for Warden.
//!
//! - `warden audit verify/tail`: inspect the signed audit trail
//! - `warden policies status/check`: inspect and validate policy sources
//! - `warden state show/history`: persisted system state, read offline
//! - `warden emergency enter/exit/shutdown/status`: drive a running daemon
//! - `warden serve`: run the governance daemon in the foreground

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use warden_gate::GateConfig;

/// Warden CLI: governance gate for autonomous agents.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Project root directory (defaults to current directory).
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the audit trail.
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
    /// Inspect and validate policy sources.
    Policies {
        #[command(subcommand)]
        command: commands::policies::PolicyCommands,
    },
    /// Show the persisted system state.
    State {
        #[command(subcommand)]
        command: commands::state::StateCommands,
    },
    /// Drive the emergency state machine of a running daemon.
    Emergency {
        /// Daemon base URL (defaults to http://<configured bind address>).
        #[arg(long)]
        url: Option<String>,
        #[command(subcommand)]
        command: commands::emergency::EmergencyCommands,
    },
    /// Run the governance daemon.
    Serve {
        /// Address to bind (overrides warden.toml and WARDEN_BIND).
        #[arg(long)]
        bind: Option<String>,
        /// Start even though the last recorded state is SHUTDOWN.
        #[arg(long)]
        acknowledge_shutdown: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warden_gate=warn".parse()?))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let project_root = cli.project_root.canonicalize().unwrap_or(cli.project_root);
    let config = GateConfig::load(&project_root)?;

    match &cli.command {
        Commands::Audit { command } => commands::audit::execute(command, &config),
        Commands::Policies { command } => commands::policies::execute(command, &config),
        Commands::State { command } => commands::state::execute(command, &config),
        Commands::Emergency { url, command } => {
            commands::emergency::execute(command, url.as_deref(), &config)
        }
        Commands::Serve {
            bind,
            acknowledge_shutdown,
        } => commands::serve::execute(config, bind.clone(), *acknowledge_shutdown),
    }
}
