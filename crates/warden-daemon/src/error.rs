// error.rs: Mapping gate errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use warden_gate::GateError;

/// Error returned by API handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retryable: bool,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    retryable: bool,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        let retryable = err.is_retryable();
        let status = match &err {
            GateError::InvalidStateTransition { .. } | GateError::ShutdownPersisted { .. } => {
                StatusCode::CONFLICT
            }
            GateError::OverrideApproval(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GateError::Audit(_) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GateError::Backend(_) => StatusCode::BAD_GATEWAY,
            GateError::Policy(_) | GateError::Config { .. } | GateError::Io { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, status = %status, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
            retryable,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            retryable: self.retryable,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_gate::SystemStateKind;

    #[test]
    fn status_mapping() {
        let err: ApiError = GateError::OverrideApproval("empty chain".into()).into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);

        let err: ApiError = GateError::InvalidStateTransition {
            from: SystemStateKind::Shutdown,
            to: SystemStateKind::Normal,
            reason: "terminal".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err: ApiError = GateError::Audit(warden_audit::AuditError::Backpressure).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.retryable);
    }
}
