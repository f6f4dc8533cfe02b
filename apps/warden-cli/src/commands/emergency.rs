// emergency.rs: Emergency subcommands, sent to a running daemon.
//
// State transitions must go through the daemon that owns the state: a
// transition written to the log behind its back would not take effect
// until the next restart.

use clap::Subcommand;
use serde_json::{json, Value};
use warden_gate::GateConfig;

#[derive(Subcommand)]
pub enum EmergencyCommands {
    /// Show the daemon's current system state.
    Status,
    /// Enter EMERGENCY_MODE: every request is denied until exit or expiry.
    Enter {
        #[arg(long)]
        reason: String,
        /// Operator identity recorded in the audit log.
        #[arg(long = "by")]
        initiated_by: String,
        /// Expire automatically after this many hours.
        #[arg(long)]
        hours: Option<f64>,
        /// Severity: low, medium, high or critical.
        #[arg(long, default_value = "high")]
        level: String,
    },
    /// Leave EMERGENCY_MODE.
    Exit {
        #[arg(long)]
        reason: String,
        #[arg(long = "by")]
        initiated_by: String,
    },
    /// Shut the system down. Terminal until an acknowledged restart.
    Shutdown {
        #[arg(long)]
        reason: String,
        #[arg(long = "by")]
        initiated_by: String,
        /// Required; shutdown cannot be undone at runtime.
        #[arg(long)]
        confirm: bool,
    },
}

pub fn execute(
    cmd: &EmergencyCommands,
    url: Option<&str>,
    config: &GateConfig,
) -> anyhow::Result<()> {
    let base = url
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://{}", config.bind));
    let client = DaemonClient::new(&base)?;

    let rt = tokio::runtime::Runtime::new()?;
    let response = rt.block_on(async {
        match cmd {
            EmergencyCommands::Status => client.get("/emergency/status").await,
            EmergencyCommands::Enter {
                reason,
                initiated_by,
                hours,
                level,
            } => {
                client
                    .post(
                        "/emergency/mode",
                        json!({
                            "reason": reason,
                            "initiated_by": initiated_by,
                            "duration_hours": hours,
                            "level": level,
                        }),
                    )
                    .await
            }
            EmergencyCommands::Exit {
                reason,
                initiated_by,
            } => {
                client
                    .post(
                        "/emergency/exit",
                        json!({"reason": reason, "initiated_by": initiated_by}),
                    )
                    .await
            }
            EmergencyCommands::Shutdown {
                reason,
                initiated_by,
                confirm,
            } => {
                if !confirm {
                    anyhow::bail!("shutdown is terminal; pass --confirm to proceed");
                }
                client
                    .post(
                        "/emergency/shutdown",
                        json!({"reason": reason, "initiated_by": initiated_by}),
                    )
                    .await
            }
        }
    })?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Minimal JSON client for the daemon API.
pub struct DaemonClient {
    client: reqwest::Client,
    base: String,
}

impl DaemonClient {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("daemon at {} unreachable: {}", self.base, e))?;
        Self::read(response).await
    }

    pub async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("daemon at {} unreachable: {}", self.base, e))?;
        Self::read(response).await
    }

    async fn read(response: reqwest::Response) -> anyhow::Result<Value> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or(text);
            anyhow::bail!("daemon returned {}: {}", status, message);
        }
        Ok(serde_json::from_str(&text)?)
    }
}
