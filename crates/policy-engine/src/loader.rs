use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;

use crate::decision::Effect;
use crate::mutation::LABELS_PREFIX;
use crate::path::{parse_path, PathError};
use crate::schema::{ConditionOp, PolicyCondition, PolicyDocument, PolicyRule};

/// Why a document was rejected by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rule id must not be empty")]
    EmptyRuleId,

    #[error("duplicate rule id: '{0}'")]
    DuplicateRuleId(String),

    #[error("exception id must not be empty")]
    EmptyExceptionId,

    #[error("duplicate exception id: '{0}'")]
    DuplicateExceptionId(String),

    #[error("exception '{exception}' references unknown rule '{rule}'")]
    UnknownRuleReference { exception: String, rule: String },

    #[error("rule '{0}' has effect 'mutate' but no mutations")]
    MutateWithoutMutations(String),

    #[error("rule '{rule}': {source}")]
    InvalidPath {
        rule: String,
        #[source]
        source: PathError,
    },

    #[error("rule '{rule}': label key must not be empty in '{path}'")]
    EmptyLabelKey { rule: String, path: String },

    #[error("rule '{rule}': invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        reason: String,
    },
}

/// Load a [`PolicyDocument`] from a YAML or JSON file and validate it.
pub fn load_policy(path: impl AsRef<Path>) -> Result<PolicyDocument> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file: {}", path.display()))?;
    load_policy_from_str(&contents)
        .with_context(|| format!("failed to load policy file: {}", path.display()))
}

/// Parse and validate a [`PolicyDocument`] from a YAML (or JSON) string.
///
/// This is the primary entry point used in tests.
pub fn load_policy_from_str(source: &str) -> Result<PolicyDocument> {
    let doc = parse_policy_str(source)?;
    validate(&doc).context("policy validation failed")?;
    Ok(doc)
}

/// Deserialize without validating. JSON documents parse as YAML.
pub fn parse_policy_str(source: &str) -> Result<PolicyDocument> {
    serde_yml::from_str(source).context("policy deserialization failed")
}

/// Structural checks run before a document is used for evaluation.
pub fn validate(doc: &PolicyDocument) -> Result<(), ValidationError> {
    let mut rule_ids = HashSet::new();
    for rule in &doc.rules {
        if rule.id.is_empty() {
            return Err(ValidationError::EmptyRuleId);
        }
        if !rule_ids.insert(rule.id.as_str()) {
            return Err(ValidationError::DuplicateRuleId(rule.id.clone()));
        }
        validate_rule(rule)?;
    }

    let mut exception_ids = HashSet::new();
    for exception in &doc.exceptions {
        if exception.id.is_empty() {
            return Err(ValidationError::EmptyExceptionId);
        }
        if !exception_ids.insert(exception.id.as_str()) {
            return Err(ValidationError::DuplicateExceptionId(exception.id.clone()));
        }
        if let Some(missing) = exception
            .rule_ids
            .iter()
            .find(|id| !rule_ids.contains(id.as_str()))
        {
            return Err(ValidationError::UnknownRuleReference {
                exception: exception.id.clone(),
                rule: missing.clone(),
            });
        }
    }

    Ok(())
}

fn validate_rule(rule: &PolicyRule) -> Result<(), ValidationError> {
    if rule.effect == Effect::Mutate && rule.mutations.is_empty() {
        return Err(ValidationError::MutateWithoutMutations(rule.id.clone()));
    }

    for condition in &rule.when {
        validate_condition(rule, condition)?;
    }

    for mutation in &rule.mutations {
        match mutation.path.strip_prefix(LABELS_PREFIX) {
            Some("") => {
                return Err(ValidationError::EmptyLabelKey {
                    rule: rule.id.clone(),
                    path: mutation.path.clone(),
                })
            }
            Some(_) => {}
            None => {
                parse_path(&mutation.path).map_err(|source| ValidationError::InvalidPath {
                    rule: rule.id.clone(),
                    source,
                })?;
            }
        }
    }
    Ok(())
}

fn validate_condition(rule: &PolicyRule, condition: &PolicyCondition) -> Result<(), ValidationError> {
    parse_path(&condition.path).map_err(|source| ValidationError::InvalidPath {
        rule: rule.id.clone(),
        source,
    })?;

    if matches!(condition.op, ConditionOp::Matches | ConditionOp::NotMatches) {
        let invalid = |reason: String| ValidationError::InvalidPattern {
            rule: rule.id.clone(),
            pattern: condition.value.to_string(),
            reason,
        };
        let pattern = condition
            .value
            .as_str()
            .ok_or_else(|| invalid("pattern must be a string".to_string()))?;
        Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DefaultEffect;
    use crate::schema::ConflictStrategy;

    fn validation_error(yaml: &str) -> ValidationError {
        let doc = parse_policy_str(yaml).unwrap();
        validate(&doc).unwrap_err()
    }

    #[test]
    fn load_minimal_policy() {
        let doc = load_policy_from_str("defaultEffect: allow\n").unwrap();
        assert_eq!(doc.default_effect, DefaultEffect::Allow);
        assert!(doc.rules.is_empty());
        assert!(doc.exceptions.is_empty());
    }

    #[test]
    fn json_documents_are_accepted() {
        let doc = load_policy_from_str(
            r#"{"defaultEffect": "deny", "execution": {"conflictStrategy": "allowOverrides"},
                "rules": [{"id": "r1", "effect": "allow"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.default_effect, DefaultEffect::Deny);
        assert_eq!(doc.execution.conflict_strategy, ConflictStrategy::AllowOverrides);
        assert_eq!(doc.rules[0].id, "r1");
    }

    #[test]
    fn reject_duplicate_rule_ids() {
        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: dup
    effect: allow
  - id: dup
    effect: deny
"#,
        );
        assert_eq!(err, ValidationError::DuplicateRuleId("dup".into()));
    }

    #[test]
    fn reject_empty_rule_id() {
        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: ""
    effect: allow
"#,
        );
        assert_eq!(err, ValidationError::EmptyRuleId);
    }

    #[test]
    fn reject_duplicate_exception_ids() {
        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: r1
    effect: deny
exceptions:
  - id: e1
    ruleIds: [r1]
  - id: e1
    ruleIds: [r1]
"#,
        );
        assert_eq!(err, ValidationError::DuplicateExceptionId("e1".into()));
    }

    #[test]
    fn reject_exception_for_unknown_rule() {
        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: r1
    effect: deny
exceptions:
  - id: e1
    ruleIds: [r1, r2]
"#,
        );
        assert!(
            err.to_string().contains("unknown rule 'r2'"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn reject_mutate_rule_without_mutations() {
        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: tag
    effect: mutate
"#,
        );
        assert_eq!(err, ValidationError::MutateWithoutMutations("tag".into()));
    }

    #[test]
    fn reject_malformed_paths() {
        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: r1
    effect: deny
    when:
      - path: "controls[x].id"
        op: exists
"#,
        );
        assert!(matches!(err, ValidationError::InvalidPath { .. }), "unexpected error: {err}");

        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: tag
    effect: mutate
    mutations:
      - op: set
        path: "metadata.labels."
        value: x
"#,
        );
        assert!(matches!(err, ValidationError::EmptyLabelKey { .. }), "unexpected error: {err}");
    }

    #[test]
    fn label_keys_may_contain_dots() {
        load_policy_from_str(
            r#"
defaultEffect: allow
rules:
  - id: tag
    effect: mutate
    mutations:
      - op: set
        path: "metadata.labels.example.com/tier"
        value: gold
"#,
        )
        .unwrap();
    }

    #[test]
    fn reject_bad_patterns() {
        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: r1
    effect: deny
    when:
      - path: title
        op: matches
        value: "(unclosed"
"#,
        );
        assert!(matches!(err, ValidationError::InvalidPattern { .. }), "unexpected error: {err}");

        let err = validation_error(
            r#"
defaultEffect: allow
rules:
  - id: r1
    effect: deny
    when:
      - path: title
        op: notMatches
        value: 42
"#,
        );
        assert!(
            err.to_string().contains("must be a string"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn load_policy_from_str_reports_validation() {
        let err = load_policy_from_str(
            r#"
defaultEffect: allow
rules:
  - id: tag
    effect: mutate
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("policy validation failed"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn load_from_nonexistent_file() {
        let err = load_policy("/does/not/exist.yaml").unwrap_err();
        assert!(
            err.to_string().contains("failed to read policy file"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(
            &path,
            r#"
name: evidence-guard
defaultEffect: allow
rules:
  - id: draft-block
    match:
      resource:
        type: Evidence
    effect: deny
"#,
        )
        .unwrap();
        let doc = load_policy(&path).unwrap();
        assert_eq!(doc.name.as_deref(), Some("evidence-guard"));
        assert_eq!(doc.rules.len(), 1);
    }
}
