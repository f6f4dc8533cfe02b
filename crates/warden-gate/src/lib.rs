//! # warden-gate
//!
//! The validation gate, emergency response manager and administrative
//! override handler for Warden.
//!
//! [`ValidationGate::evaluate`] decides every agent action: it checks the
//! global [`SystemState`], evaluates the active policy set through an
//! [`EvaluationBackend`], scores the request's risk, applies any active
//! override and seals the resulting [`PolicyDecision`] into the audit trail.
//! Nothing in this pipeline fails open: a missing core policy, a slow
//! backend or an internal error all produce a deny with a reason.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use warden_gate::{GateConfig, GateRuntime};
//! use warden_policy::EvaluationRequest;
//!
//! # async fn run() -> Result<(), warden_gate::GateError> {
//! let runtime = GateRuntime::open(GateConfig::load(".")?, false).await?;
//! let decision = runtime
//!     .gate
//!     .evaluate(EvaluationRequest::new("create_agent", "agent", "planner"))
//!     .await?;
//! assert!(decision.deny);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod decision;
pub mod emergency;
pub mod error;
pub mod gate;
pub mod overrides;
pub mod registry;
pub mod runtime;

pub use backend::{EvaluationBackend, HttpBackend, LocalBackend};
pub use config::{FailSafeMode, GateConfig};
pub use decision::{combine, PolicyDecision};
pub use emergency::{
    events_from_records, CallbackOutcome, EmergencyEvent, EmergencyEventType, EmergencyLevel,
    EmergencyManager, ShutdownCallback, ShutdownReport, SystemState, SystemStateKind,
    TransitionOutcome,
};
pub use error::GateError;
pub use gate::{GateHealth, GateParts, ValidationGate, WorkflowDecision};
pub use overrides::{Fingerprint, OverrideDecision, OverrideHandler, OverrideRecord, OverrideRequest};
pub use registry::DecisionRegistry;
pub use runtime::GateRuntime;
