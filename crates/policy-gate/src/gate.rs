use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use policy_engine::{PolicyContext, PolicyEnforcer, PolicyError};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Counts for one batch of evaluated contexts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GateReport {
    pub evaluated: usize,
    pub violations: usize,
}

/// A context file holds either one context object or an array of them.
pub fn parse_contexts(raw: &str) -> Result<Vec<PolicyContext>> {
    let value: Value = serde_json::from_str(raw).context("context file is not valid JSON")?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| {
                serde_json::from_value(item).with_context(|| format!("invalid context at index {idx}"))
            })
            .collect(),
        Value::Object(_) => Ok(vec![serde_json::from_value(value).context("invalid context")?]),
        other => bail!("expected a context object or array, found {}", json_kind(&other)),
    }
}

pub async fn read_contexts(path: &Path) -> Result<Vec<PolicyContext>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read context file: {}", path.display()))?;
    parse_contexts(&raw).with_context(|| format!("failed to parse context file: {}", path.display()))
}

/// Evaluate every context in order and write one JSON line per context.
///
/// With `enforce`, deny decisions become violation lines and are counted;
/// any other engine failure aborts the batch.
pub async fn run<W: Write>(
    enforcer: &PolicyEnforcer,
    contexts: Vec<PolicyContext>,
    enforce: bool,
    out: &mut W,
) -> Result<GateReport> {
    let mut report = GateReport::default();

    for mut ctx in contexts {
        let result = if enforce {
            enforcer.enforce(&mut ctx).await
        } else {
            enforcer.evaluate(&mut ctx).await
        };

        let outcome = match result {
            Ok(decision) => json!({ "decision": decision }),
            Err(PolicyError::Violation(violation)) => {
                report.violations += 1;
                json!({
                    "violation": {
                        "message": violation.message,
                        "ruleId": violation.rule_id,
                        "remediationHint": violation.remediation_hint,
                    }
                })
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("evaluation failed for {}:{}", ctx.resource_type, ctx.action)
                })
            }
        };
        report.evaluated += 1;

        let mut line = json!({
            "resourceType": ctx.resource_type,
            "action": ctx.action,
            "environment": ctx.environment,
            "correlationId": ctx.correlation_id,
            "resource": ctx.resource,
        });
        if let (Value::Object(line), Value::Object(outcome)) = (&mut line, outcome) {
            line.extend(outcome);
        }
        serde_json::to_writer(&mut *out, &line).context("failed to write decision")?;
        writeln!(out).context("failed to write decision")?;
    }

    Ok(report)
}

/// [`run`], then the metrics line when asked for, then drain the audit log.
///
/// The enforcer is dropped and the audit writer awaited even when the batch
/// fails, so decisions made before the failure are still written.
pub async fn run_and_flush<W: Write>(
    enforcer: PolicyEnforcer,
    audit: Option<JoinHandle<u64>>,
    contexts: Vec<PolicyContext>,
    enforce: bool,
    print_metrics: bool,
    out: &mut W,
) -> Result<GateReport> {
    let result = match run(&enforcer, contexts, enforce, out).await {
        Ok(report) if print_metrics => write_metrics(&enforcer, out).map(|()| report),
        other => other,
    };

    // Dropping the enforcer releases the last sink handle so the writer drains.
    drop(enforcer);
    let Some(handle) = audit else {
        return result;
    };
    match handle.await {
        Ok(written) => {
            info!(written, "audit log flushed");
            result
        }
        Err(join_err) => {
            let join_err = anyhow::Error::new(join_err).context("audit writer task failed");
            match result {
                Ok(_) => Err(join_err),
                Err(err) => {
                    error!(error = %format!("{join_err:#}"), "audit log may be incomplete");
                    Err(err)
                }
            }
        }
    }
}

fn write_metrics<W: Write>(enforcer: &PolicyEnforcer, out: &mut W) -> Result<()> {
    serde_json::to_writer(&mut *out, &json!({ "metrics": enforcer.metrics() }))
        .context("failed to write metrics")?;
    writeln!(out).context("failed to write metrics")?;
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
