//! # policy-engine
//!
//! Decides whether an action on a resource is allowed, denied, or mutated
//! before it proceeds. Declarative policy documents (YAML or JSON) are
//! matched against a runtime [`PolicyContext`] using dotted path access into
//! the resource; matching rules are combined under a configurable conflict
//! strategy, exceptions suppress rules temporarily, and mutating rules
//! rewrite the resource in place.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use policy_engine::{PolicyContext, PolicyEnforcer, PolicyStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = PolicyStore::open("policy.yaml").await?;
//! let enforcer = PolicyEnforcer::new(Arc::new(store));
//!
//! let mut ctx = PolicyContext::new(
//!     "Evidence",
//!     "approve",
//!     "prod",
//!     serde_json::json!({"status": "Draft"}),
//! );
//! let decision = enforcer.evaluate(&mut ctx).await?;
//! println!("{:?}", decision);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod condition;
mod context;
mod decision;
mod enforcer;
mod error;
pub mod loader;
pub mod matcher;
pub mod metrics;
pub mod mutation;
pub mod path;
pub mod resolver;
mod schema;
pub mod source;

// Re-export primary public API at crate root.
pub use audit::{DecisionAuditor, TracingAuditor};
pub use context::PolicyContext;
pub use decision::{DefaultEffect, Effect, PolicyDecision, Severity};
pub use enforcer::{EvaluationStage, PolicyEnforcer, PolicyEnforcerBuilder, VALIDATION_FAILED_MESSAGE};
pub use error::{PolicyError, PolicySourceError, PolicyViolation};
pub use metrics::{MetricsSnapshot, PolicyMetrics};
pub use path::{PathError, PathResolver};
pub use schema::{
    ConditionOp, ConflictStrategy, ExecutionOptions, MutationOp, PolicyCondition,
    PolicyDocument, PolicyException, PolicyMatch, PolicyMutation, PolicyRule, PolicyTarget,
    PrincipalMatch, Remediation, ResourceMatch,
};
pub use source::{PolicySource, PolicyStore};
