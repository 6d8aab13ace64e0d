use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::{DefaultEffect, Effect, Severity};

/// Resource type entry in [`PolicyTarget::resource_types`] that matches every
/// resource type.
pub const ANY_RESOURCE_TYPE: &str = "Any";

/// Wildcard for rule-level resource type and environment matches.
pub const WILDCARD: &str = "*";

/// Root policy configuration. One immutable snapshot is used per evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    /// Informational display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Document-level applicability filter.
    #[serde(default)]
    pub target: PolicyTarget,
    /// Result when nothing else applies or validation fails.
    pub default_effect: DefaultEffect,
    #[serde(default)]
    pub execution: ExecutionOptions,
    /// Rules in authoring order; evaluation order is (priority, id).
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub exceptions: Vec<PolicyException>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTarget {
    #[serde(default)]
    pub resource_types: BTreeSet<String>,
    /// Empty means every environment.
    #[serde(default)]
    pub environments: BTreeSet<String>,
}

impl Default for PolicyTarget {
    fn default() -> Self {
        Self {
            resource_types: BTreeSet::from([ANY_RESOURCE_TYPE.to_string()]),
            environments: BTreeSet::new(),
        }
    }
}

impl PolicyTarget {
    pub fn covers_resource_type(&self, resource_type: &str) -> bool {
        self.resource_types.contains(ANY_RESOURCE_TYPE) || self.resource_types.contains(resource_type)
    }

    pub fn covers_environment(&self, environment: &str) -> bool {
        self.environments.is_empty() || self.environments.contains(environment)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// Stop at the first deny decision.
    #[serde(default)]
    pub short_circuit: bool,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
}

/// Algorithm used to collapse per-rule decisions into a final decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    #[default]
    DenyOverrides,
    AllowOverrides,
    HighestPriorityWins,
    /// Any unrecognized strategy name. Resolves to the default effect.
    #[serde(other)]
    Unknown,
}

/// A single policy rule: match criteria, AND-ed conditions, and an effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// Unique, non-empty rule id.
    pub id: String,
    /// Lower numeric priority is evaluated first. Default 100.
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, rename = "match")]
    pub match_spec: PolicyMatch,
    /// Conditions on the resource; all must hold.
    #[serde(default)]
    pub when: Vec<PolicyCondition>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub remediation: Remediation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Applied in order when `effect` is `mutate`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<PolicyMutation>,
}

fn default_priority() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remediation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Match criteria shared by rules and exceptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMatch {
    #[serde(default)]
    pub resource: ResourceMatch,
    #[serde(default = "wildcard")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<PrincipalMatch>,
}

impl Default for PolicyMatch {
    fn default() -> Self {
        Self {
            resource: ResourceMatch::default(),
            environment: wildcard(),
            principal: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMatch {
    #[serde(rename = "type", default = "wildcard")]
    pub resource_type: String,
}

impl Default for ResourceMatch {
    fn default() -> Self {
        Self {
            resource_type: wildcard(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrincipalMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Any one of these roles is sufficient.
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

/// A time-bounded override that suppresses the listed rules for contexts
/// matching `match`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyException {
    pub id: String,
    #[serde(default)]
    pub rule_ids: BTreeSet<String>,
    #[serde(default, rename = "match")]
    pub match_spec: PolicyMatch,
    /// Timestamps without an offset are read as UTC.
    #[serde(default, with = "utc_timestamp", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyException {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    pub fn suppresses(&self, rule_id: &str) -> bool {
        self.rule_ids.contains(rule_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCondition {
    /// Dotted path into the resource, e.g. `controls[0].controlId`.
    pub path: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOp {
    Exists,
    Equals,
    NotEquals,
    In,
    NotIn,
    Matches,
    NotMatches,
    /// Any unrecognized operator. Always evaluates to false.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMutation {
    pub op: MutationOp,
    pub path: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationOp {
    Set,
    Remove,
    /// Append `value` to the list at `path`.
    Add,
    /// Any unrecognized operation. Skipped with a warning.
    #[serde(other)]
    Unknown,
}

/// Parse a timestamp as UTC. Accepts RFC 3339, an offset-less date-time,
/// or a bare date (midnight UTC).
pub fn parse_utc_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| date.and_time(chrono::NaiveTime::default()).and_utc())
}

mod utc_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_some(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            super::parse_utc_timestamp(&s)
                .map_err(|e| D::Error::custom(format!("invalid timestamp '{s}': {e}")))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn deserialize_minimal_document() {
        let yaml = r#"
defaultEffect: allow
"#;
        let doc: PolicyDocument = serde_yml::from_str(yaml).unwrap();
        assert_eq!(doc.default_effect, DefaultEffect::Allow);
        assert!(doc.rules.is_empty());
        assert!(doc.exceptions.is_empty());
        assert!(doc.target.covers_resource_type("Evidence"));
        assert!(doc.target.covers_environment("prod"));
        assert!(!doc.execution.short_circuit);
        assert_eq!(doc.execution.conflict_strategy, ConflictStrategy::DenyOverrides);
    }

    #[test]
    fn deserialize_full_document() {
        let yaml = r#"
name: evidence-guard
target:
  resourceTypes: [Evidence, Control]
  environments: [prod]
defaultEffect: deny
execution:
  shortCircuit: true
  conflictStrategy: highestPriorityWins
rules:
  - id: draft-block
    priority: 1
    match:
      resource:
        type: Evidence
      environment: "*"
      principal:
        roles: [Auditor]
    when:
      - path: status
        op: equals
        value: Draft
    effect: deny
    message: Draft evidence cannot be approved
    remediation:
      hint: Verify the evidence first
    severity: high
    metadata:
      framework: ISO27001
  - id: label-owner
    effect: mutate
    mutations:
      - op: set
        path: metadata.labels.owner
        value: grc-team
exceptions:
  - id: audit-window
    ruleIds: [draft-block]
    match:
      environment: prod
    expiresAt: "2030-01-01T00:00:00"
"#;
        let doc: PolicyDocument = serde_yml::from_str(yaml).unwrap();
        assert_eq!(doc.name.as_deref(), Some("evidence-guard"));
        assert!(doc.target.covers_resource_type("Control"));
        assert!(!doc.target.covers_resource_type("Risk"));
        assert!(!doc.target.covers_environment("staging"));
        assert_eq!(doc.execution.conflict_strategy, ConflictStrategy::HighestPriorityWins);

        let rule = &doc.rules[0];
        assert_eq!(rule.priority, 1);
        assert!(rule.enabled);
        assert_eq!(rule.match_spec.resource.resource_type, "Evidence");
        assert_eq!(rule.match_spec.environment, "*");
        let principal = rule.match_spec.principal.as_ref().unwrap();
        assert!(principal.id.is_none());
        assert!(principal.roles.contains("Auditor"));
        assert_eq!(rule.when[0].op, ConditionOp::Equals);
        assert_eq!(rule.when[0].value, serde_json::json!("Draft"));
        assert_eq!(rule.remediation.hint.as_deref(), Some("Verify the evidence first"));
        assert_eq!(rule.severity, Some(Severity::High));
        assert_eq!(rule.metadata["framework"], "ISO27001");

        let mutate = &doc.rules[1];
        assert_eq!(mutate.priority, 100);
        assert_eq!(mutate.match_spec.resource.resource_type, "*");
        assert_eq!(mutate.mutations[0].op, MutationOp::Set);

        let exception = &doc.exceptions[0];
        assert!(exception.suppresses("draft-block"));
        assert_eq!(
            exception.expires_at,
            Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn unknown_names_fall_back_to_unknown_variants() {
        let yaml = r#"
defaultEffect: deny
execution:
  conflictStrategy: firstApplicable
rules:
  - id: r1
    effect: mutate
    when:
      - path: status
        op: startsWith
        value: Dr
    mutations:
      - op: prepend
        path: tags
        value: x
"#;
        let doc: PolicyDocument = serde_yml::from_str(yaml).unwrap();
        assert_eq!(doc.execution.conflict_strategy, ConflictStrategy::Unknown);
        assert_eq!(doc.rules[0].when[0].op, ConditionOp::Unknown);
        assert_eq!(doc.rules[0].mutations[0].op, MutationOp::Unknown);
    }

    #[test]
    fn timestamps_are_normalized_to_utc() {
        let with_offset = parse_utc_timestamp("2026-03-01T12:00:00+02:00").unwrap();
        assert_eq!(with_offset, Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap());

        let naive = parse_utc_timestamp("2026-03-01T12:00:00").unwrap();
        assert_eq!(naive, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());

        let date_only = parse_utc_timestamp("2026-03-01").unwrap();
        assert_eq!(date_only, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());

        assert!(parse_utc_timestamp("next tuesday").is_err());
    }

    #[test]
    fn exception_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let mut exception = PolicyException {
            id: "e1".to_string(),
            rule_ids: BTreeSet::new(),
            match_spec: PolicyMatch::default(),
            expires_at: None,
            reason: None,
        };
        assert!(!exception.is_expired(now));

        exception.expires_at = Some(Utc.with_ymd_and_hms(2026, 5, 31, 0, 0, 0).unwrap());
        assert!(exception.is_expired(now));

        exception.expires_at = Some(Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 0).unwrap());
        assert!(!exception.is_expired(now));
    }
}
