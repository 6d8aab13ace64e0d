use tracing::warn;

use crate::decision::{DefaultEffect, Effect, PolicyDecision};
use crate::schema::ConflictStrategy;

/// Collapse per-rule decisions into the final decision.
///
/// Decisions are expected in evaluation order; every strategy breaks ties in
/// favour of the earliest decision.
pub fn resolve(
    decisions: &[PolicyDecision],
    strategy: ConflictStrategy,
    default_effect: DefaultEffect,
) -> PolicyDecision {
    if decisions.is_empty() {
        return PolicyDecision::from_default(default_effect);
    }

    let chosen = match strategy {
        ConflictStrategy::DenyOverrides => first_with(decisions, Effect::Deny)
            .or_else(|| decisions.iter().find(|d| d.effect != Effect::Allow)),
        ConflictStrategy::AllowOverrides => first_with(decisions, Effect::Allow)
            .or_else(|| decisions.iter().find(|d| d.effect != Effect::Deny)),
        ConflictStrategy::HighestPriorityWins => highest_severity(decisions),
        ConflictStrategy::Unknown => {
            warn!("unknown conflict strategy; falling back to the default effect");
            None
        }
    };

    chosen
        .cloned()
        .unwrap_or_else(|| PolicyDecision::from_default(default_effect))
}

fn first_with(decisions: &[PolicyDecision], effect: Effect) -> Option<&PolicyDecision> {
    decisions.iter().find(|d| d.effect == effect)
}

/// Stable: on equal rank the earlier decision wins.
fn highest_severity(decisions: &[PolicyDecision]) -> Option<&PolicyDecision> {
    decisions.iter().fold(None, |best, candidate| match best {
        Some(current) if current.severity_rank() >= candidate.severity_rank() => Some(current),
        _ => Some(candidate),
    })
}
