use std::time::Duration;

use thiserror::Error;

use crate::decision::PolicyDecision;
use crate::mutation::MutationError;
use crate::path::PathError;

pub const DEFAULT_VIOLATION_MESSAGE: &str = "Policy violation";
pub const UNKNOWN_RULE_ID: &str = "unknown";
pub const DEFAULT_REMEDIATION_HINT: &str = "Contact administrator";

/// Errors surfaced by [`crate::PolicyEnforcer`].
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A deny decision returned from `enforce`.
    #[error(transparent)]
    Violation(#[from] PolicyViolation),

    #[error("policy source failed: {0}")]
    Source(#[from] PolicySourceError),

    #[error("policy source did not respond within {0:?}")]
    SourceTimeout(Duration),

    #[error("condition evaluation failed: {0}")]
    Path(#[from] PathError),

    #[error("mutation failed: {0}")]
    Mutation(#[from] MutationError),
}

impl PolicyError {
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Violation(_))
    }
}

/// The caller-facing description of a denied action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (rule: {rule_id})")]
pub struct PolicyViolation {
    pub message: String,
    pub rule_id: String,
    pub remediation_hint: String,
}

impl From<&PolicyDecision> for PolicyViolation {
    fn from(decision: &PolicyDecision) -> Self {
        Self {
            message: decision
                .message
                .clone()
                .unwrap_or_else(|| DEFAULT_VIOLATION_MESSAGE.to_string()),
            rule_id: decision
                .matched_rule_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_RULE_ID.to_string()),
            remediation_hint: decision
                .remediation_hint
                .clone()
                .unwrap_or_else(|| DEFAULT_REMEDIATION_HINT.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicySourceError {
    #[error("failed to read policy from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy: {0}")]
    Parse(String),

    #[error("policy source unavailable: {0}")]
    Unavailable(String),
}
