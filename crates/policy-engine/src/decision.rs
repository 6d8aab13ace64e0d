use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Effect a rule produces, and the effect of a resolved decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Effect {
    /// Let the action proceed.
    Allow,
    /// Reject the action.
    Deny,
    /// Transform the resource, then keep evaluating.
    Mutate,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
            Effect::Mutate => "mutate",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect used when no rule decides the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DefaultEffect {
    Allow,
    Deny,
}

impl From<DefaultEffect> for Effect {
    fn from(value: DefaultEffect) -> Self {
        match value {
            DefaultEffect::Allow => Effect::Allow,
            DefaultEffect::Deny => Effect::Deny,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Rank used by the `highestPriorityWins` strategy.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of evaluating one rule, or the final resolved outcome of an
/// evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub effect: Effect,
    /// Id of the rule that produced this decision, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PolicyDecision {
    /// A decision carrying only the document's default effect.
    pub fn from_default(effect: DefaultEffect) -> Self {
        Self {
            effect: effect.into(),
            matched_rule_id: None,
            message: None,
            remediation_hint: None,
            severity: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Default-effect decision with an explanatory message.
    pub fn from_default_with_message(effect: DefaultEffect, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::from_default(effect)
        }
    }

    pub fn is_allow(&self) -> bool {
        self.effect == Effect::Allow
    }

    pub fn is_deny(&self) -> bool {
        self.effect == Effect::Deny
    }

    /// Severity rank, treating a missing severity as the lowest rank.
    pub fn severity_rank(&self) -> u8 {
        self.severity.map_or(1, Severity::rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_decision_has_no_rule() {
        let d = PolicyDecision::from_default(DefaultEffect::Deny);
        assert_eq!(d.effect, Effect::Deny);
        assert!(d.matched_rule_id.is_none());
        assert!(d.message.is_none());
    }

    #[test]
    fn default_decision_with_message() {
        let d = PolicyDecision::from_default_with_message(DefaultEffect::Allow, "fallback");
        assert!(d.is_allow());
        assert_eq!(d.message.as_deref(), Some("fallback"));
    }

    #[test]
    fn severity_ranks() {
        assert_eq!(Severity::Critical.rank(), 4);
        assert_eq!(Severity::High.rank(), 3);
        assert_eq!(Severity::Medium.rank(), 2);
        assert_eq!(Severity::Low.rank(), 1);

        let unranked = PolicyDecision::from_default(DefaultEffect::Allow);
        assert_eq!(unranked.severity_rank(), 1);
    }

    #[test]
    fn serializes_camel_case_and_skips_empty() {
        let d = PolicyDecision {
            matched_rule_id: Some("r1".to_string()),
            ..PolicyDecision::from_default(DefaultEffect::Deny)
        };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json, serde_json::json!({"effect": "deny", "matchedRuleId": "r1"}));
    }
}
