use async_trait::async_trait;
use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource, PolicyDecisionRecord};
use serde_json::json;
use tracing::info;

use crate::context::PolicyContext;
use crate::decision::PolicyDecision;

/// Component name recorded on audit entries.
pub const AUDIT_COMPONENT: &str = "policy-engine";

/// Receives every completed evaluation. Failures are logged by the enforcer
/// and never change the decision.
#[async_trait]
pub trait DecisionAuditor: Send + Sync {
    async fn log_decision(
        &self,
        ctx: &PolicyContext,
        decisions: &[PolicyDecision],
        final_decision: &PolicyDecision,
    ) -> anyhow::Result<()>;
}

/// Emits one structured `tracing` event per decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditor;

#[async_trait]
impl DecisionAuditor for TracingAuditor {
    async fn log_decision(
        &self,
        ctx: &PolicyContext,
        decisions: &[PolicyDecision],
        final_decision: &PolicyDecision,
    ) -> anyhow::Result<()> {
        info!(
            target: "policy_audit",
            resource_type = %ctx.resource_type,
            action = %ctx.action,
            environment = %ctx.environment,
            principal_id = ?ctx.principal_id,
            correlation_id = ?ctx.correlation_id,
            effect = %final_decision.effect,
            matched_rule_id = ?final_decision.matched_rule_id,
            matched_rules = decisions.len(),
            "policy decision"
        );
        Ok(())
    }
}

#[async_trait]
impl DecisionAuditor for AuditSink {
    async fn log_decision(
        &self,
        ctx: &PolicyContext,
        decisions: &[PolicyDecision],
        final_decision: &PolicyDecision,
    ) -> anyhow::Result<()> {
        self.log(audit_entry(ctx, decisions, final_decision)).await?;
        Ok(())
    }
}

/// Build the JSON-lines record for one evaluation.
pub fn audit_entry(
    ctx: &PolicyContext,
    decisions: &[PolicyDecision],
    final_decision: &PolicyDecision,
) -> AuditEntry {
    let source = AuditSource::new(AUDIT_COMPONENT)
        .with_tenant(ctx.tenant_id.clone())
        .with_principal(ctx.principal_id.clone())
        .with_correlation_id(ctx.correlation_id.clone());

    let details = json!({
        "resourceType": ctx.resource_type,
        "action": ctx.action,
        "environment": ctx.environment,
        "decisions": decisions,
    });

    AuditEntry::new(
        AuditEventType::for_effect(final_decision.effect.as_str()),
        source,
        details,
    )
    .with_timestamp(ctx.timestamp)
    .with_policy_decision(PolicyDecisionRecord {
        effect: final_decision.effect.to_string(),
        matched_rule_id: final_decision.matched_rule_id.clone(),
        message: final_decision.message.clone(),
        severity: final_decision.severity.map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DefaultEffect, Effect, Severity};

    fn denied() -> PolicyDecision {
        PolicyDecision {
            effect: Effect::Deny,
            matched_rule_id: Some("draft-block".into()),
            message: Some("Draft evidence cannot be approved".into()),
            severity: Some(Severity::High),
            ..PolicyDecision::from_default(DefaultEffect::Allow)
        }
    }

    fn ctx() -> PolicyContext {
        PolicyContext::new("Evidence", "approve", "prod", json!({"status": "Draft"}))
            .with_principal("u-1", ["Auditor"])
            .with_tenant("t-1")
            .with_correlation_id("req-9")
    }

    #[test]
    fn entry_carries_context_and_decision() {
        let entry = audit_entry(&ctx(), &[denied()], &denied());
        assert_eq!(entry.event_type, AuditEventType::PolicyDenied);
        assert_eq!(entry.source.component, AUDIT_COMPONENT);
        assert_eq!(entry.source.tenant_id.as_deref(), Some("t-1"));
        assert_eq!(entry.source.correlation_id.as_deref(), Some("req-9"));
        assert_eq!(entry.details["resourceType"], "Evidence");
        assert_eq!(entry.details["decisions"][0]["matchedRuleId"], "draft-block");

        let record = entry.policy_decision.unwrap();
        assert_eq!(record.effect, "deny");
        assert_eq!(record.severity.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn tracing_auditor_never_fails() {
        TracingAuditor
            .log_decision(&ctx(), &[], &PolicyDecision::from_default(DefaultEffect::Allow))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn audit_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let (sink, handle) = AuditSink::start(&path).await.unwrap();

        sink.log_decision(&ctx(), &[denied()], &denied()).await.unwrap();
        drop(sink);
        assert_eq!(handle.await.unwrap(), 1);

        let entries = audit_log::read_entries(&path).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::PolicyDenied);
        assert_eq!(entries[0].source.principal_id.as_deref(), Some("u-1"));
    }
}
