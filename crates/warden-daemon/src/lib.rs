//! # warden-daemon
//!
//! HTTP API for the Warden governance gate.
//!
//! Agents call `POST /validate` before acting; operators drive the
//! emergency state machine, overrides and policy reloads through the other
//! endpoints. The server stops on its own when the system enters SHUTDOWN.
//!
//! | Method | Path | |
//! |---|---|---|
//! | POST | `/validate` | evaluate one request |
//! | POST | `/validate/workflow` | evaluate ordered steps |
//! | POST | `/emergency/shutdown` | terminal shutdown |
//! | POST | `/emergency/mode` | enter emergency mode |
//! | POST | `/emergency/exit` | leave emergency mode |
//! | GET | `/emergency/status` | current system state |
//! | GET | `/emergency/history?limit=N` | recent emergency events |
//! | POST | `/maintenance/enter`, `/maintenance/exit` | maintenance window |
//! | POST | `/override`, GET `/overrides` | administrative overrides |
//! | GET | `/policies/status`, POST `/policies/reload` | policy set |
//! | GET | `/integrity/validate` | audit chain verification |
//! | GET | `/health` | liveness and readiness |

pub mod api;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use warden_gate::{EmergencyEvent, ShutdownCallback, ValidationGate};

/// Shared handler state.
pub struct AppState {
    pub gate: ValidationGate,
}

/// Build the API router around a gate.
pub fn build_router(gate: ValidationGate) -> Router {
    let state = Arc::new(AppState { gate });

    Router::new()
        .route("/health", get(api::health))
        .route("/validate", post(api::validate))
        .route("/validate/workflow", post(api::validate_workflow))
        .route("/emergency/shutdown", post(api::emergency_shutdown))
        .route("/emergency/mode", post(api::emergency_mode))
        .route("/emergency/exit", post(api::emergency_exit))
        .route("/emergency/status", get(api::emergency_status))
        .route("/emergency/history", get(api::emergency_history))
        .route("/maintenance/enter", post(api::maintenance_enter))
        .route("/maintenance/exit", post(api::maintenance_exit))
        .route("/override", post(api::submit_override))
        .route("/overrides", get(api::list_overrides))
        .route("/policies/status", get(api::policies_status))
        .route("/policies/reload", post(api::policies_reload))
        .route("/integrity/validate", get(api::integrity_validate))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Stops the HTTP server once the system has shut down.
struct StopServer {
    stop: Arc<Notify>,
}

#[async_trait]
impl ShutdownCallback for StopServer {
    fn name(&self) -> &str {
        "http-server"
    }

    async fn on_shutdown(&self, _event: &EmergencyEvent) -> Result<(), String> {
        self.stop.notify_one();
        Ok(())
    }
}

/// How often expired emergency and maintenance windows are checked when no
/// requests arrive.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Serve the API on `bind` until SHUTDOWN or Ctrl-C.
pub async fn serve(gate: ValidationGate, bind: &str) -> std::io::Result<()> {
    let stop = Arc::new(Notify::new());
    gate.emergency().register_shutdown_callback(Arc::new(StopServer {
        stop: Arc::clone(&stop),
    }));

    let ticker = tokio::spawn({
        let emergency = Arc::clone(gate.emergency());
        async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = emergency.refresh().await {
                    tracing::warn!(error = %e, "emergency state refresh failed");
                }
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "warden daemon listening");

    let result = axum::serve(listener, build_router(gate.clone()))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = stop.notified() => tracing::warn!("system shut down; stopping HTTP server"),
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received; stopping HTTP server"),
            }
        })
        .await;

    ticker.abort();
    if let Err(e) = gate.audit().flush().await {
        tracing::error!(error = %e, "final audit flush failed");
    }
    result
}
