//! Dispatcher metrics

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::TaskType;

/// Counters shared by all workers of a dispatcher
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    reaped: AtomicU64,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, task_type: TaskType) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task_type = %task_type, "task completed");
    }

    pub fn record_retry(&self, task_type: TaskType) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.retried.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task_type = %task_type, "task rescheduled");
    }

    pub fn record_failure(&self, task_type: TaskType) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task_type = %task_type, "task failed");
    }

    pub fn record_reaped(&self, count: u64) {
        self.reaped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub reaped: u64,
}

impl MetricsSummary {
    /// Success rate over processed tasks
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.processed as f64
        }
    }

    /// Format as human-readable
    pub fn format(&self) -> String {
        format!(
            "processed={}, succeeded={}, retried={}, failed={}, reaped={}, success_rate={:.1}%",
            self.processed,
            self.succeeded,
            self.retried,
            self.failed,
            self.reaped,
            self.success_rate() * 100.0
        )
    }
}

/// Counts by status as reported by the queue, for the operator status view
pub fn format_status_counts(counts: &[(crate::models::TaskStatus, i64)]) -> String {
    let map: HashMap<String, i64> = counts
        .iter()
        .map(|(status, count)| (status.to_string(), *count))
        .collect();
    let mut keys: Vec<_> = map.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("{}={}", k, map[*k]))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = DispatcherMetrics::new();
        metrics.record_success(TaskType::ChargePayment);
        metrics.record_success(TaskType::CreateDelivery);
        metrics.record_retry(TaskType::ChargePayment);
        metrics.record_failure(TaskType::CreateOrder);

        let summary = metrics.summary();
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.success_rate(), 0.5);
    }

    #[test]
    fn test_empty_rate() {
        assert_eq!(MetricsSummary::default().success_rate(), 0.0);
    }
}
