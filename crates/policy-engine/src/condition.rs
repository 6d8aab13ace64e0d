use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use tracing::{trace, warn};

use crate::path::{PathError, PathResolver};
use crate::schema::{ConditionOp, PolicyCondition};

/// Compiled patterns kept per evaluator. Further patterns compile on every call.
const MAX_CACHED_PATTERNS: usize = 256;

/// Evaluates [`PolicyCondition`]s against a resource.
///
/// Semantics for absent values (the path does not resolve):
///
/// * `exists` is false.
/// * `equals`/`in` treat the value as `null`; `notEquals`/`notIn` are their
///   exact complements.
/// * `matches` is false and `notMatches` is true.
///
/// A malformed `in`/`notIn` list or an invalid regex makes both the
/// operator and its negation false.
#[derive(Debug, Default)]
pub struct ConditionEvaluator {
    paths: Arc<PathResolver>,
    /// `None` marks a pattern that failed to compile.
    regexes: DashMap<String, Option<Regex>>,
}

impl ConditionEvaluator {
    pub fn new(paths: Arc<PathResolver>) -> Self {
        Self {
            paths,
            regexes: DashMap::new(),
        }
    }

    pub fn evaluate(&self, condition: &PolicyCondition, resource: &Value) -> Result<bool, PathError> {
        let resolved = self.paths.resolve(resource, &condition.path)?;
        let actual = resolved.unwrap_or(&Value::Null);

        let outcome = match condition.op {
            ConditionOp::Exists => !actual.is_null(),
            ConditionOp::Equals => values_equal(actual, &condition.value),
            ConditionOp::NotEquals => !values_equal(actual, &condition.value),
            ConditionOp::In => self.membership(condition, actual).unwrap_or(false),
            ConditionOp::NotIn => self.membership(condition, actual).is_some_and(|found| !found),
            ConditionOp::Matches => self.regex_match(condition, actual).unwrap_or(false),
            ConditionOp::NotMatches => self.regex_match(condition, actual).is_some_and(|hit| !hit),
            ConditionOp::Unknown => {
                warn!(path = %condition.path, "unknown condition operator; evaluating to false");
                false
            }
        };

        trace!(path = %condition.path, op = ?condition.op, outcome, "condition evaluated");
        Ok(outcome)
    }

    /// `None` when the condition value is not a list.
    fn membership(&self, condition: &PolicyCondition, actual: &Value) -> Option<bool> {
        match &condition.value {
            Value::Array(candidates) => Some(candidates.iter().any(|c| values_equal(actual, c))),
            other => {
                warn!(
                    path = %condition.path,
                    found = crate::path::kind(other),
                    "membership condition requires a list value"
                );
                None
            }
        }
    }

    /// `None` when the pattern is unusable. Non-matchable values never match.
    fn regex_match(&self, condition: &PolicyCondition, actual: &Value) -> Option<bool> {
        let Value::String(pattern) = &condition.value else {
            warn!(path = %condition.path, "regex condition requires a string pattern");
            return None;
        };

        if let Some(cached) = self.regexes.get(pattern) {
            return cached.value().as_ref().map(|re| is_match(re, actual));
        }

        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(
                    pattern = pattern.as_str(),
                    error = %e,
                    "failed to compile condition regex; treating as non-match"
                );
                None
            }
        };
        let outcome = compiled.as_ref().map(|re| is_match(re, actual));
        if self.regexes.len() < MAX_CACHED_PATTERNS {
            self.regexes.insert(pattern.clone(), compiled);
        }
        outcome
    }
}

fn is_match(re: &Regex, actual: &Value) -> bool {
    matchable_text(actual).is_some_and(|text| re.is_match(&text))
}

/// String form used for regex matching. Only scalars are matchable.
fn matchable_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Structural equality where numbers compare by numeric value, so `1` equals
/// `1.0`. No coercion across types.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
                x == y
            } else {
                a.as_f64() == b.as_f64()
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => left == right,
    }
}
