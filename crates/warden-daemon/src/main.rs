//! # warden-daemon
//!
//! Warden governance gate daemon.
//!
//! Loads `.warden/` from the project root, restores the persisted system
//! state and serves the HTTP API.
//!
//! ## Usage
//!
//! ```text
//! warden-daemon --project-root /srv/agents --bind 127.0.0.1:8787
//! ```
//!
//! After a SHUTDOWN the daemon refuses to start until restarted with
//! `--acknowledge-shutdown`.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use warden_gate::{GateConfig, GateRuntime};

/// Warden governance gate.
#[derive(Parser)]
#[command(name = "warden-daemon", about = "Warden governance gate daemon")]
struct Cli {
    /// Project root directory (defaults to current directory).
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Address to bind (overrides warden.toml and WARDEN_BIND).
    #[arg(long)]
    bind: Option<String>,

    /// Start even though the last recorded state is SHUTDOWN.
    #[arg(long)]
    acknowledge_shutdown: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("warden_gate=info".parse()?)
                .add_directive("warden_policy=info".parse()?)
                .add_directive("warden_audit=info".parse()?)
                .add_directive("warden_daemon=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let project_root = cli.project_root.canonicalize()?;

    tracing::info!("Starting Warden daemon");
    tracing::info!("Project root: {}", project_root.display());

    let mut config = GateConfig::load(&project_root)?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    let bind = config.bind.clone();

    let runtime = GateRuntime::open(config, cli.acknowledge_shutdown)
        .await
        .inspect_err(|e| tracing::error!("startup refused: {}", e))?;

    warden_daemon::serve(runtime.gate, &bind).await?;

    tracing::info!("Warden daemon stopped");
    Ok(())
}
