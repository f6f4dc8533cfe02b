// backend.rs: Evaluation backends.
//
// A backend turns (policy set, request) into the core/custom decision
// fragments. Two implementations:
//
//   LocalBackend: the in-process rule interpreter from warden-policy.
//   HttpBackend: an external evaluator (e.g. an OPA-style service)
//                reached over HTTP.
//
// The gate bounds every call with its own timeout, so backends do not
// need to enforce one themselves (HttpBackend still sets a client timeout
// so stalled sockets are released).

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use warden_policy::{EvaluationRequest, EvaluationResponse, LocalInterpreter, PolicySet};

use crate::error::GateError;

/// Evaluates a request against a policy set.
#[async_trait]
pub trait EvaluationBackend: Send + Sync {
    /// Short name for logs and status output.
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        set: &PolicySet,
        request: &EvaluationRequest,
    ) -> Result<EvaluationResponse, GateError>;

    async fn health_check(&self) -> bool;
}

// ── Local ──

/// In-process backend.
pub struct LocalBackend {
    interpreter: LocalInterpreter,
}

impl LocalBackend {
    pub fn new(interpreter: LocalInterpreter) -> Self {
        Self { interpreter }
    }
}

#[async_trait]
impl EvaluationBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn evaluate(
        &self,
        set: &PolicySet,
        request: &EvaluationRequest,
    ) -> Result<EvaluationResponse, GateError> {
        Ok(self.interpreter.evaluate(set, request))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

// ── HTTP ──

#[derive(Serialize)]
struct BackendInput<'a> {
    #[serde(flatten)]
    request: &'a EvaluationRequest,
    policy: serde_json::Value,
}

#[derive(Serialize)]
struct BackendEnvelope<'a> {
    input: BackendInput<'a>,
}

/// External evaluator reached with `POST {url}` and `GET {url}/health`.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Backend(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Accept `{"result": {...}}` (OPA data API) or the bare response.
///
/// The core fragment must be present; `custom` may be omitted.
fn parse_response(body: serde_json::Value) -> Result<EvaluationResponse, GateError> {
    let inner = match body {
        serde_json::Value::Object(mut obj) if obj.contains_key("result") => obj
            .remove("result")
            .unwrap_or(serde_json::Value::Null),
        other => other,
    };
    if !inner.is_object() {
        return Err(GateError::Backend(format!(
            "expected an object with core/custom fragments, got {}",
            inner
        )));
    }
    if inner.get("core").map_or(true, |core| core.is_null()) {
        return Err(GateError::Backend(
            "response has no core policy fragment".to_string(),
        ));
    }
    serde_json::from_value(inner).map_err(|e| GateError::Backend(format!("bad response: {}", e)))
}

#[async_trait]
impl EvaluationBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn evaluate(
        &self,
        set: &PolicySet,
        request: &EvaluationRequest,
    ) -> Result<EvaluationResponse, GateError> {
        let envelope = BackendEnvelope {
            input: BackendInput {
                request,
                policy: set.policy_document(),
            },
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GateError::BackendTimeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    GateError::Backend(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(GateError::Backend(format!(
                "backend returned HTTP {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GateError::Backend(format!("unreadable response: {}", e)))?;
        parse_response(body)
    }

    async fn health_check(&self) -> bool {
        match self.client.get(format!("{}/health", self.url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "backend health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wrapped_and_bare_responses() {
        let wrapped = json!({"result": {"core": {"allow": true, "deny": false}, "custom": {"allow": false, "deny": true, "reasons": ["nope"]}}});
        let resp = parse_response(wrapped).unwrap();
        assert!(resp.core.allow);
        assert_eq!(resp.custom.reasons, vec!["nope"]);

        let bare = json!({"core": {"allow": false, "deny": true}});
        let resp = parse_response(bare).unwrap();
        assert!(resp.core.deny);
        assert!(!resp.custom.allow);
    }

    #[test]
    fn missing_core_fragment_is_an_error() {
        let custom_only = json!({"custom": {"allow": true, "deny": false}});
        let err = parse_response(custom_only).unwrap_err();
        assert!(err.to_string().contains("no core policy fragment"));

        let wrapped = json!({"result": {"core": null, "custom": {"allow": true}}});
        assert!(parse_response(wrapped).is_err());
        assert!(parse_response(json!({"result": {}})).is_err());
    }

    #[test]
    fn rejects_non_object_response() {
        assert!(parse_response(json!({"result": true})).is_err());
        assert!(parse_response(json!([1, 2])).is_err());
    }

    #[test]
    fn envelope_carries_request_and_policy() {
        let req = EvaluationRequest::new("read", "document", "agent-a");
        let env = BackendEnvelope {
            input: BackendInput {
                request: &req,
                policy: json!({"rules": []}),
            },
        };
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["input"]["action"], "read");
        assert_eq!(value["input"]["policy"]["rules"], json!([]));
    }
}
