// api.rs: Request handlers for the governance HTTP API.
//
// Handlers are thin: decode, call the gate, encode. A denied request is a
// successful HTTP call (200 with `deny: true`); HTTP errors are reserved
// for requests the gate could not process at all.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use warden_gate::{
    EmergencyEvent, EmergencyEventType, EmergencyLevel, OverrideRecord, OverrideRequest,
    PolicyDecision, ShutdownReport, SystemState, TransitionOutcome, WorkflowDecision,
};
use warden_policy::{EvaluationRequest, PolicySetSummary};

use crate::error::ApiError;
use crate::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Request bodies ──

#[derive(Debug, Deserialize)]
pub struct WorkflowBody {
    pub steps: Vec<EvaluationRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ShutdownBody {
    pub reason: String,
    pub initiated_by: String,
    #[serde(default = "default_shutdown_type")]
    pub event_type: EmergencyEventType,
    #[serde(default = "default_critical")]
    pub level: EmergencyLevel,
}

#[derive(Debug, Deserialize)]
pub struct EmergencyBody {
    pub reason: String,
    pub initiated_by: String,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    #[serde(default)]
    pub duration_hours: Option<f64>,
    #[serde(default = "default_manual")]
    pub event_type: EmergencyEventType,
    #[serde(default = "default_high")]
    pub level: EmergencyLevel,
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceBody {
    pub reason: String,
    pub initiated_by: String,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExitBody {
    pub reason: String,
    pub initiated_by: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_shutdown_type() -> EmergencyEventType {
    EmergencyEventType::ManualShutdown
}

fn default_manual() -> EmergencyEventType {
    EmergencyEventType::Manual
}

fn default_critical() -> EmergencyLevel {
    EmergencyLevel::Critical
}

fn default_high() -> EmergencyLevel {
    EmergencyLevel::High
}

fn default_history_limit() -> usize {
    50
}

/// Longest accepted emergency or maintenance window.
const MAX_WINDOW_HOURS: i64 = 24 * 365 * 100;

fn duration(
    seconds: Option<u64>,
    hours: Option<f64>,
) -> Result<Option<chrono::TimeDelta>, ApiError> {
    let invalid = || {
        ApiError::bad_request(format!(
            "invalid_duration: must be positive and at most {} hours",
            MAX_WINDOW_HOURS
        ))
    };
    if let Some(s) = seconds {
        return i64::try_from(s)
            .ok()
            .filter(|s| *s > 0 && *s / 3_600 <= MAX_WINDOW_HOURS)
            .and_then(chrono::TimeDelta::try_seconds)
            .map(Some)
            .ok_or_else(invalid);
    }
    match hours {
        None => Ok(None),
        Some(h) if h.is_finite() && h > 0.0 && h <= MAX_WINDOW_HOURS as f64 => {
            chrono::TimeDelta::try_milliseconds((h * 3_600_000.0) as i64)
                .map(Some)
                .ok_or_else(invalid)
        }
        Some(_) => Err(invalid()),
    }
}

// ── Validation ──

pub async fn validate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EvaluationRequest>,
) -> ApiResult<PolicyDecision> {
    Ok(Json(state.gate.evaluate(request).await?))
}

pub async fn validate_workflow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WorkflowBody>,
) -> ApiResult<WorkflowDecision> {
    Ok(Json(state.gate.evaluate_workflow(body.steps).await?))
}

// ── Emergency ──

pub async fn emergency_shutdown(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ShutdownBody>,
) -> ApiResult<ShutdownReport> {
    let report = state
        .gate
        .emergency()
        .shutdown(&body.reason, &body.initiated_by, body.event_type, body.level)
        .await?;
    Ok(Json(report))
}

pub async fn emergency_mode(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmergencyBody>,
) -> ApiResult<TransitionOutcome> {
    let duration = duration(body.duration_seconds, body.duration_hours)?;
    let outcome = state
        .gate
        .emergency()
        .enter_emergency_mode(
            &body.reason,
            &body.initiated_by,
            duration,
            body.event_type,
            body.level,
        )
        .await?;
    Ok(Json(outcome))
}

pub async fn emergency_exit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExitBody>,
) -> ApiResult<TransitionOutcome> {
    let outcome = state
        .gate
        .emergency()
        .exit_emergency_mode(&body.reason, &body.initiated_by)
        .await?;
    Ok(Json(outcome))
}

pub async fn emergency_status(State(state): State<Arc<AppState>>) -> Json<SystemState> {
    Json(state.gate.emergency().status())
}

pub async fn emergency_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<EmergencyEvent>> {
    Json(state.gate.emergency().history(params.limit))
}

pub async fn maintenance_enter(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MaintenanceBody>,
) -> ApiResult<TransitionOutcome> {
    let duration = duration(body.duration_seconds, None)?;
    let outcome = state
        .gate
        .emergency()
        .enter_maintenance(&body.reason, &body.initiated_by, duration)
        .await?;
    Ok(Json(outcome))
}

pub async fn maintenance_exit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExitBody>,
) -> ApiResult<TransitionOutcome> {
    let outcome = state
        .gate
        .emergency()
        .exit_maintenance(&body.reason, &body.initiated_by)
        .await?;
    Ok(Json(outcome))
}

// ── Overrides ──

pub async fn submit_override(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OverrideRequest>,
) -> Result<(StatusCode, Json<OverrideRecord>), ApiError> {
    let record = state.gate.overrides().submit(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_overrides(State(state): State<Arc<AppState>>) -> Json<Vec<OverrideRecord>> {
    Json(state.gate.overrides().active())
}

// ── Policies ──

pub async fn policies_status(State(state): State<Arc<AppState>>) -> Json<PolicySetSummary> {
    Json(state.gate.store().snapshot().summary())
}

pub async fn policies_reload(State(state): State<Arc<AppState>>) -> ApiResult<PolicySetSummary> {
    Ok(Json(state.gate.reload_policies().await?))
}

// ── Health & integrity ──

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.gate.health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

pub async fn integrity_validate(
    State(state): State<Arc<AppState>>,
) -> ApiResult<warden_audit::IntegrityReport> {
    let report = state
        .gate
        .audit()
        .validate_integrity()
        .await
        .map_err(warden_gate::GateError::from)?;
    if !report.valid {
        tracing::error!(first_break = ?report.first_break, "audit integrity check failed");
    }
    Ok(Json(report))
}
