//! # warden-policy
//!
//! Policy sources, the non-overridable core bundle, merge resolution and
//! risk scoring for Warden.
//!
//! Bundles are loaded from several origins with fixed priorities, merged
//! into one immutable [`PolicySet`], and published through a
//! [`PolicyStore`] that swaps sets atomically. The core bundle is always
//! present: if it is missing or corrupt it is regenerated from the copy
//! compiled into the binary, and if that fails nothing is served.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use warden_policy::{
//!     EvaluationRequest, LoaderConfig, LocalInterpreter, PolicyLoader, PolicyStore, RiskConfig,
//! };
//!
//! let store = PolicyStore::open(PolicyLoader::new(LoaderConfig::new(".warden/policies"))).unwrap();
//! let interpreter = LocalInterpreter::new(RiskConfig::default()).unwrap();
//! let request = EvaluationRequest::new("create_agent", "agent", "planner");
//! let response = interpreter.evaluate(&store.snapshot(), &request);
//! assert!(response.core.deny);
//! ```

pub mod bundle;
pub mod content;
pub mod core;
pub mod error;
pub mod interpreter;
pub mod loader;
pub mod request;
pub mod risk;
pub mod set;
pub mod source;
pub mod store;

pub use bundle::{PolicyBundle, PolicyRule, RuleCondition, RuleEffect};
pub use content::{ContentDetector, ContentFinding, ContentScan};
pub use error::PolicyError;
pub use interpreter::{DecisionFragment, EvaluationResponse, LocalInterpreter};
pub use loader::{LoaderConfig, PolicyLoader};
pub use request::EvaluationRequest;
pub use risk::{Clock, RiskAssessment, RiskConfig, RiskFactor, RiskScorer};
pub use set::{
    ConflictKind, MergedRule, PolicyConflict, PolicySet, PolicySetSummary, Shadowing,
    SkippedSource,
};
pub use source::{PolicyOrigin, PolicySource};
pub use store::PolicyStore;
