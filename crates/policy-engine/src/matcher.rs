use crate::condition::ConditionEvaluator;
use crate::context::PolicyContext;
use crate::path::PathError;
use crate::schema::{PolicyCondition, PolicyException, PolicyMatch, PolicyRule, PrincipalMatch, WILDCARD};

/// Borrowed view of what decides applicability: match criteria plus
/// conditions. Rules contribute both; exceptions only their match block.
#[derive(Debug, Clone, Copy)]
pub struct MatchTarget<'a> {
    pub criteria: &'a PolicyMatch,
    pub conditions: &'a [PolicyCondition],
}

impl<'a> From<&'a PolicyRule> for MatchTarget<'a> {
    fn from(rule: &'a PolicyRule) -> Self {
        Self {
            criteria: &rule.match_spec,
            conditions: &rule.when,
        }
    }
}

impl<'a> From<&'a PolicyException> for MatchTarget<'a> {
    fn from(exception: &'a PolicyException) -> Self {
        Self {
            criteria: &exception.match_spec,
            conditions: &[],
        }
    }
}

/// Decides whether a rule or exception applies to a context.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    conditions: ConditionEvaluator,
}

impl RuleMatcher {
    pub fn new(conditions: ConditionEvaluator) -> Self {
        Self { conditions }
    }

    /// Checks, in order and stopping at the first failure: resource type,
    /// environment, principal, then every condition.
    pub fn is_applicable<'a>(
        &self,
        target: impl Into<MatchTarget<'a>>,
        ctx: &PolicyContext,
    ) -> Result<bool, PathError> {
        let target = target.into();
        let criteria = target.criteria;

        if !matches_resource_type(&criteria.resource.resource_type, &ctx.resource_type) {
            return Ok(false);
        }
        if !matches_environment(&criteria.environment, &ctx.environment) {
            return Ok(false);
        }
        if let Some(principal) = &criteria.principal {
            if !matches_principal(principal, ctx) {
                return Ok(false);
            }
        }
        for condition in target.conditions {
            if !self.conditions.evaluate(condition, &ctx.resource)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// `"*"` matches any resource type; anything else is an exact match.
pub fn matches_resource_type(pattern: &str, resource_type: &str) -> bool {
    pattern == WILDCARD || pattern == resource_type
}

/// `"*"` matches any environment; anything else is an exact match.
pub fn matches_environment(pattern: &str, environment: &str) -> bool {
    pattern == WILDCARD || pattern == environment
}

/// A non-empty id must equal the caller's id; non-empty roles need at least
/// one role in common with the caller.
pub fn matches_principal(principal: &PrincipalMatch, ctx: &PolicyContext) -> bool {
    if let Some(id) = principal.id.as_deref().filter(|id| !id.is_empty()) {
        if ctx.principal_id.as_deref() != Some(id) {
            return false;
        }
    }
    principal.roles.is_empty()
        || ctx
            .principal_roles
            .iter()
            .any(|role| principal.roles.contains(role))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::schema::ConditionOp;

    fn rule_from_yaml(yaml: &str) -> PolicyRule {
        serde_yml::from_str(yaml).expect("test YAML should parse")
    }

    fn ctx() -> PolicyContext {
        PolicyContext::new("Evidence", "approve", "prod", json!({"status": "Draft"}))
            .with_principal("u-1", ["Auditor"])
    }

    // ---- field matchers ----

    #[test]
    fn wildcards_and_exact_matches() {
        assert!(matches_resource_type("*", "Evidence"));
        assert!(matches_resource_type("Evidence", "Evidence"));
        assert!(!matches_resource_type("Risk", "Evidence"));
        assert!(!matches_resource_type("evidence", "Evidence"));

        assert!(matches_environment("*", "staging"));
        assert!(matches_environment("prod", "prod"));
        assert!(!matches_environment("prod", "staging"));
    }

    #[test]
    fn principal_id_must_match() {
        let principal = PrincipalMatch {
            id: Some("u-1".into()),
            roles: BTreeSet::new(),
        };
        assert!(matches_principal(&principal, &ctx()));

        let other = PrincipalMatch {
            id: Some("u-2".into()),
            roles: BTreeSet::new(),
        };
        assert!(!matches_principal(&other, &ctx()));

        let anonymous = PolicyContext::new("Evidence", "approve", "prod", json!({}));
        assert!(!matches_principal(&principal, &anonymous));
    }

    #[test]
    fn empty_principal_id_is_ignored() {
        let principal = PrincipalMatch {
            id: Some(String::new()),
            roles: BTreeSet::new(),
        };
        let anonymous = PolicyContext::new("Evidence", "approve", "prod", json!({}));
        assert!(matches_principal(&principal, &anonymous));
    }

    #[test]
    fn principal_roles_need_one_in_common() {
        let principal = PrincipalMatch {
            id: None,
            roles: BTreeSet::from(["Admin".to_string(), "Auditor".to_string()]),
        };
        assert!(matches_principal(&principal, &ctx()));

        let admins_only = PrincipalMatch {
            id: None,
            roles: BTreeSet::from(["Admin".to_string()]),
        };
        assert!(!matches_principal(&admins_only, &ctx()));
    }

    // ---- full applicability ----

    #[test]
    fn rule_with_conditions() {
        let matcher = RuleMatcher::default();
        let rule = rule_from_yaml(
            r#"
id: draft-block
match:
  resource:
    type: Evidence
  environment: "*"
when:
  - path: status
    op: equals
    value: Draft
effect: deny
"#,
        );
        assert!(matcher.is_applicable(&rule, &ctx()).unwrap());

        let mut verified = ctx();
        verified.resource = json!({"status": "Verified"});
        assert!(!matcher.is_applicable(&rule, &verified).unwrap());
    }

    #[test]
    fn environment_mismatch_skips_conditions() {
        let matcher = RuleMatcher::default();
        let rule = rule_from_yaml(
            r#"
id: prod-only
match:
  environment: prod
when:
  - path: "broken["
    op: exists
effect: deny
"#,
        );
        let staging = PolicyContext::new("Evidence", "approve", "staging", json!({}));
        // The malformed path is never reached.
        assert!(!matcher.is_applicable(&rule, &staging).unwrap());
        assert!(matcher.is_applicable(&rule, &ctx()).is_err());
    }

    #[test]
    fn exceptions_share_the_rule_matcher() {
        let matcher = RuleMatcher::default();
        let exception: PolicyException = serde_yml::from_str(
            r#"
id: auditors-window
ruleIds: [draft-block]
match:
  resource:
    type: Evidence
  principal:
    roles: [Auditor]
"#,
        )
        .unwrap();
        assert!(matcher.is_applicable(&exception, &ctx()).unwrap());

        let target = MatchTarget::from(&exception);
        assert!(target.conditions.is_empty());

        let manager = PolicyContext::new("Evidence", "approve", "prod", json!({}))
            .with_principal("u-7", ["RiskManager"]);
        assert!(!matcher.is_applicable(&exception, &manager).unwrap());
    }

    #[test]
    fn all_conditions_must_hold() {
        let matcher = RuleMatcher::default();
        let mut rule = rule_from_yaml(
            r#"
id: multi
effect: deny
when:
  - path: status
    op: equals
    value: Draft
"#,
        );
        rule.when.push(PolicyCondition {
            path: "owner".into(),
            op: ConditionOp::Exists,
            value: serde_json::Value::Null,
        });
        assert!(!matcher.is_applicable(&rule, &ctx()).unwrap());

        let mut owned = ctx();
        owned.resource["owner"] = json!("ana");
        assert!(matcher.is_applicable(&rule, &owned).unwrap());
    }
}
