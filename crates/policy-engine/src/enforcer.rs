use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, trace, warn};

use crate::audit::{DecisionAuditor, TracingAuditor};
use crate::condition::ConditionEvaluator;
use crate::context::PolicyContext;
use crate::decision::{Effect, PolicyDecision};
use crate::error::{PolicyError, PolicySourceError, PolicyViolation};
use crate::matcher::RuleMatcher;
use crate::metrics::{MetricsSnapshot, PolicyMetrics};
use crate::mutation::MutationApplier;
use crate::path::PathResolver;
use crate::resolver;
use crate::schema::{PolicyDocument, PolicyException, PolicyRule};
use crate::source::PolicySource;

pub const VALIDATION_FAILED_MESSAGE: &str = "Policy validation failed";

/// Progress marker for one evaluation, attached to trace and error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStage {
    Loaded,
    Validated,
    Filtered,
    Evaluating,
    Resolved,
    Audited,
}

impl EvaluationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::Validated => "validated",
            Self::Filtered => "filtered",
            Self::Evaluating => "evaluating",
            Self::Resolved => "resolved",
            Self::Audited => "audited",
        }
    }
}

impl fmt::Display for EvaluationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluates contexts against the current policy snapshot.
///
/// `evaluate` takes `&self`, so one enforcer can serve concurrent callers.
/// The only state shared between evaluations is the metrics registry and the
/// path and regex caches.
pub struct PolicyEnforcer {
    source: Arc<dyn PolicySource>,
    auditor: Arc<dyn DecisionAuditor>,
    metrics: Arc<PolicyMetrics>,
    matcher: RuleMatcher,
    mutations: MutationApplier,
    source_timeout: Option<Duration>,
}

impl fmt::Debug for PolicyEnforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEnforcer")
            .field("source_timeout", &self.source_timeout)
            .field("metric_keys", &self.metrics.snapshot().len())
            .finish_non_exhaustive()
    }
}

pub struct PolicyEnforcerBuilder {
    source: Arc<dyn PolicySource>,
    auditor: Option<Arc<dyn DecisionAuditor>>,
    metrics: Option<Arc<PolicyMetrics>>,
    source_timeout: Option<Duration>,
}

impl PolicyEnforcerBuilder {
    /// Defaults to [`TracingAuditor`].
    pub fn auditor(mut self, auditor: Arc<dyn DecisionAuditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// Share a metrics registry with other enforcers. Defaults to a private one.
    pub fn metrics(mut self, metrics: Arc<PolicyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bound every policy source call. Unbounded by default.
    pub fn source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> PolicyEnforcer {
        let paths = Arc::new(PathResolver::new());
        PolicyEnforcer {
            source: self.source,
            auditor: self.auditor.unwrap_or_else(|| Arc::new(TracingAuditor)),
            metrics: self.metrics.unwrap_or_default(),
            matcher: RuleMatcher::new(ConditionEvaluator::new(Arc::clone(&paths))),
            mutations: MutationApplier::new(paths),
            source_timeout: self.source_timeout,
        }
    }
}

impl PolicyEnforcer {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self::builder(source).build()
    }

    pub fn builder(source: Arc<dyn PolicySource>) -> PolicyEnforcerBuilder {
        PolicyEnforcerBuilder {
            source,
            auditor: None,
            metrics: None,
            source_timeout: None,
        }
    }

    /// Evaluate `ctx` against the current policy.
    ///
    /// Mutating rules rewrite `ctx.resource` in place. Deny is a normal
    /// decision here; use [`enforce`](Self::enforce) to turn it into an error.
    pub async fn evaluate(&self, ctx: &mut PolicyContext) -> Result<PolicyDecision, PolicyError> {
        let started = Instant::now();
        let mut stage = EvaluationStage::Loaded;

        let result = self.run(ctx, &mut stage, started).await;
        if let Err(err) = &result {
            error!(
                %stage,
                resource_type = %ctx.resource_type,
                action = %ctx.action,
                correlation_id = ?ctx.correlation_id,
                error = %err,
                "policy evaluation failed"
            );
        }
        result
    }

    /// Like [`evaluate`](Self::evaluate), but a deny decision is returned as
    /// [`PolicyError::Violation`].
    pub async fn enforce(&self, ctx: &mut PolicyContext) -> Result<PolicyDecision, PolicyError> {
        let decision = self.evaluate(ctx).await?;
        if decision.is_deny() {
            let violation = PolicyViolation::from(&decision);
            info!(
                rule_id = %violation.rule_id,
                resource_type = %ctx.resource_type,
                action = %ctx.action,
                "policy violation"
            );
            return Err(violation.into());
        }
        Ok(decision)
    }

    /// `true` only for a final `allow`; a mutate decision is not an allow.
    pub async fn is_allowed(&self, ctx: &mut PolicyContext) -> Result<bool, PolicyError> {
        Ok(self.evaluate(ctx).await?.is_allow())
    }

    /// Snapshot of per `"resourceType:action"` counters.
    pub fn metrics(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.metrics.snapshot()
    }

    async fn run(
        &self,
        ctx: &mut PolicyContext,
        stage: &mut EvaluationStage,
        started: Instant,
    ) -> Result<PolicyDecision, PolicyError> {
        let doc = self.with_timeout(self.source.get_policy()).await?;
        trace!(stage = stage.as_str(), policy = ?doc.name, rules = doc.rules.len(), "policy loaded");

        *stage = EvaluationStage::Validated;
        if !self.with_timeout(self.source.validate_policy(&doc)).await? {
            warn!(policy = ?doc.name, "policy validation failed; using default effect");
            return Ok(PolicyDecision::from_default_with_message(
                doc.default_effect,
                VALIDATION_FAILED_MESSAGE,
            ));
        }

        *stage = EvaluationStage::Filtered;
        if !doc.target.covers_resource_type(&ctx.resource_type) {
            debug!(resource_type = %ctx.resource_type, "resource type outside policy target");
            return Ok(PolicyDecision::from_default(doc.default_effect));
        }
        if !doc.target.covers_environment(&ctx.environment) {
            debug!(environment = %ctx.environment, "environment outside policy target");
            return Ok(PolicyDecision::from_default(doc.default_effect));
        }

        let exceptions = self.applicable_exceptions(&doc, ctx)?;
        let rules = self.applicable_rules(&doc, ctx, &exceptions)?;
        trace!(stage = stage.as_str(), rules = rules.len(), exceptions = exceptions.len(), "rules filtered");

        *stage = EvaluationStage::Evaluating;
        let mut decisions = Vec::with_capacity(rules.len());
        for rule in rules {
            debug!(rule_id = %rule.id, effect = %rule.effect, "rule matched");
            decisions.push(decision_for(rule));
            match rule.effect {
                Effect::Mutate => {
                    self.mutations.apply(&rule.mutations, &mut ctx.resource)?;
                    trace!(rule_id = %rule.id, mutations = rule.mutations.len(), "mutations applied");
                }
                Effect::Deny if doc.execution.short_circuit => {
                    debug!(rule_id = %rule.id, "short-circuit on deny");
                    break;
                }
                _ => {}
            }
        }

        *stage = EvaluationStage::Resolved;
        let decision = resolver::resolve(
            &decisions,
            doc.execution.conflict_strategy,
            doc.default_effect,
        );
        trace!(stage = stage.as_str(), effect = %decision.effect, matched_rule_id = ?decision.matched_rule_id, "decision resolved");

        *stage = EvaluationStage::Audited;
        if let Err(err) = self.auditor.log_decision(ctx, &decisions, &decision).await {
            let detail = format!("{err:#}");
            warn!(
                error = %detail,
                correlation_id = ?ctx.correlation_id,
                "failed to audit policy decision"
            );
        }

        self.metrics
            .record(&ctx.metrics_key(), decision.is_deny(), started.elapsed());

        Ok(decision)
    }

    fn applicable_exceptions<'d>(
        &self,
        doc: &'d PolicyDocument,
        ctx: &PolicyContext,
    ) -> Result<Vec<&'d PolicyException>, PolicyError> {
        let now = Utc::now();
        let mut applicable = Vec::new();
        for exception in &doc.exceptions {
            if exception.is_expired(now) {
                debug!(exception_id = %exception.id, expires_at = ?exception.expires_at, "exception expired");
                continue;
            }
            if self.matcher.is_applicable(exception, ctx)? {
                applicable.push(exception);
            }
        }
        Ok(applicable)
    }

    /// Enabled, matching, unsuppressed rules in (priority, id) order.
    fn applicable_rules<'d>(
        &self,
        doc: &'d PolicyDocument,
        ctx: &PolicyContext,
        exceptions: &[&PolicyException],
    ) -> Result<Vec<&'d PolicyRule>, PolicyError> {
        let mut rules = Vec::new();
        for rule in doc.rules.iter().filter(|r| r.enabled) {
            if self.matcher.is_applicable(rule, ctx)? {
                rules.push(rule);
            }
        }
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        rules.retain(|rule| match exceptions.iter().find(|e| e.suppresses(&rule.id)) {
            Some(exception) => {
                debug!(rule_id = %rule.id, exception_id = %exception.id, "rule suppressed by exception");
                false
            }
            None => true,
        });
        Ok(rules)
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, PolicySourceError>>,
    ) -> Result<T, PolicyError> {
        match self.source_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| PolicyError::SourceTimeout(limit))?
                .map_err(PolicyError::from),
            None => call.await.map_err(PolicyError::from),
        }
    }
}

fn decision_for(rule: &PolicyRule) -> PolicyDecision {
    PolicyDecision {
        effect: rule.effect,
        matched_rule_id: Some(rule.id.clone()),
        message: rule.message.clone(),
        remediation_hint: rule.remediation.hint.clone(),
        severity: rule.severity,
        metadata: rule.metadata.clone(),
    }
}
