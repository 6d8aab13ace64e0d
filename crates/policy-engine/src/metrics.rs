use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Per-key counters. All updates are lock-free.
#[derive(Debug, Default)]
struct MetricsCell {
    total_evaluations: AtomicU64,
    denied_count: AtomicU64,
    /// Two-sample rolling average, in microseconds.
    average_duration_micros: AtomicU64,
}

/// Point-in-time copy of the counters for one `"resourceType:action"` key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_evaluations: u64,
    pub denied_count: u64,
    pub average_duration_ms: f64,
}

/// Evaluation counters keyed by `"resourceType:action"`.
///
/// Share one instance between enforcers via `Arc`; tests can use a fresh
/// instance each.
#[derive(Debug, Default)]
pub struct PolicyMetrics {
    cells: DashMap<String, Arc<MetricsCell>>,
}

impl PolicyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str, denied: bool, duration: Duration) {
        let cell = self.cell(key);
        cell.total_evaluations.fetch_add(1, Ordering::Relaxed);
        if denied {
            cell.denied_count.fetch_add(1, Ordering::Relaxed);
        }

        let sample = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        // The closure always returns Some, so the update cannot fail.
        let _ = cell
            .average_duration_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current == 0 {
                    sample
                } else {
                    current.saturating_add(sample) / 2
                })
            });
    }

    pub fn get(&self, key: &str) -> Option<MetricsSnapshot> {
        self.cells.get(key).map(|cell| snapshot(cell.value()))
    }

    /// Copy of every key's counters, in key order.
    pub fn snapshot(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.cells
            .iter()
            .map(|entry| (entry.key().clone(), snapshot(entry.value())))
            .collect()
    }

    fn cell(&self, key: &str) -> Arc<MetricsCell> {
        if let Some(existing) = self.cells.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.cells.entry(key.to_string()).or_default().value())
    }
}

fn snapshot(cell: &MetricsCell) -> MetricsSnapshot {
    let micros = cell.average_duration_micros.load(Ordering::Acquire);
    MetricsSnapshot {
        total_evaluations: cell.total_evaluations.load(Ordering::Relaxed),
        denied_count: cell.denied_count.load(Ordering::Relaxed),
        average_duration_ms: micros as f64 / 1000.0,
    }
}
