//! Metrics collection for node monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxrelay_engine::{AcceptOutcome, ExecutionContext};
use serde::Serialize;

/// Node metrics.
pub struct Metrics {
    /// Ticks offered to the aggregator.
    pub ticks_received: AtomicU64,
    /// Ticks that were not raw rates.
    pub ticks_ignored: AtomicU64,
    /// Ticks that failed validation.
    pub ticks_rejected: AtomicU64,
    /// Ticks for symbols without expected providers.
    pub ticks_unconfigured: AtomicU64,
    /// Complete windows held back by time skew.
    pub skew_exceeded: AtomicU64,
    /// Windows handed to the worker pool.
    pub windows_triggered: AtomicU64,
    /// Pipeline runs currently executing.
    pub runs_active: AtomicU64,
    /// Pipeline runs finished.
    pub runs_completed: AtomicU64,
    /// Runs that exceeded the wall-clock budget.
    pub runs_over_budget: AtomicU64,
    /// Stage errors recorded across all runs.
    pub stage_errors: AtomicU64,
    /// Rules skipped for incomplete inputs.
    pub rules_skipped: AtomicU64,
    /// Snapshots received by the sink.
    pub snapshots_published: AtomicU64,
    /// Snapshot records received by the sink.
    pub snapshot_records: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            ticks_received: AtomicU64::new(0),
            ticks_ignored: AtomicU64::new(0),
            ticks_rejected: AtomicU64::new(0),
            ticks_unconfigured: AtomicU64::new(0),
            skew_exceeded: AtomicU64::new(0),
            windows_triggered: AtomicU64::new(0),
            runs_active: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_over_budget: AtomicU64::new(0),
            stage_errors: AtomicU64::new(0),
            rules_skipped: AtomicU64::new(0),
            snapshots_published: AtomicU64::new(0),
            snapshot_records: AtomicU64::new(0),
        }
    }

    /// Count a tick and the aggregator's verdict on it.
    pub fn tick(&self, outcome: &AcceptOutcome) {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            AcceptOutcome::Ignored => &self.ticks_ignored,
            AcceptOutcome::Rejected(_) => &self.ticks_rejected,
            AcceptOutcome::Unconfigured => &self.ticks_unconfigured,
            AcceptOutcome::SkewExceeded { .. } => &self.skew_exceeded,
            AcceptOutcome::Buffered { .. } | AcceptOutcome::Triggered { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a window entering the worker pool.
    pub fn window_triggered(&self) {
        self.windows_triggered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pipeline run starting. The run counts as active until the
    /// returned guard is dropped.
    pub fn run_started(self: &Arc<Self>) -> ActiveRun {
        self.runs_active.fetch_add(1, Ordering::Relaxed);
        ActiveRun {
            metrics: Arc::clone(self),
        }
    }

    /// Record a finished pipeline run.
    pub fn run_finished(&self, ctx: &ExecutionContext, over_budget: bool) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        if over_budget {
            self.runs_over_budget.fetch_add(1, Ordering::Relaxed);
        }
        self.stage_errors
            .fetch_add(ctx.stage_errors.len() as u64, Ordering::Relaxed);
        self.rules_skipped
            .fetch_add(ctx.skipped_rules.len() as u64, Ordering::Relaxed);
    }

    /// Record a snapshot reaching the sink.
    pub fn snapshot_published(&self, records: usize) {
        self.snapshots_published.fetch_add(1, Ordering::Relaxed);
        self.snapshot_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    /// Number of pipeline runs still executing.
    pub fn in_flight(&self) -> u64 {
        self.runs_active.load(Ordering::Relaxed)
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            ticks_ignored: self.ticks_ignored.load(Ordering::Relaxed),
            ticks_rejected: self.ticks_rejected.load(Ordering::Relaxed),
            ticks_unconfigured: self.ticks_unconfigured.load(Ordering::Relaxed),
            skew_exceeded: self.skew_exceeded.load(Ordering::Relaxed),
            windows_triggered: self.windows_triggered.load(Ordering::Relaxed),
            runs_active: self.runs_active.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_over_budget: self.runs_over_budget.load(Ordering::Relaxed),
            stage_errors: self.stage_errors.load(Ordering::Relaxed),
            rules_skipped: self.rules_skipped.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
            snapshot_records: self.snapshot_records.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ticks_received: u64,
    pub ticks_ignored: u64,
    pub ticks_rejected: u64,
    pub ticks_unconfigured: u64,
    pub skew_exceeded: u64,
    pub windows_triggered: u64,
    pub runs_active: u64,
    pub runs_completed: u64,
    pub runs_over_budget: u64,
    pub stage_errors: u64,
    pub rules_skipped: u64,
    pub snapshots_published: u64,
    pub snapshot_records: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

/// Keeps one run in `runs_active`, even if the worker task unwinds.
#[must_use]
pub struct ActiveRun {
    metrics: SharedMetrics,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.metrics.runs_active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxrelay_common::RateError;

    #[test]
    fn test_tick_outcomes() {
        let metrics = Metrics::new();

        metrics.tick(&AcceptOutcome::Buffered {
            collected: 1,
            expected: 2,
        });
        metrics.tick(&AcceptOutcome::Rejected(RateError::InvalidSymbol("X".into())));
        metrics.tick(&AcceptOutcome::SkewExceeded { skew_ms: 4000 });
        metrics.tick(&AcceptOutcome::Triggered { providers: 2 });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ticks_received, 4);
        assert_eq!(snapshot.ticks_rejected, 1);
        assert_eq!(snapshot.skew_exceeded, 1);
        assert_eq!(snapshot.ticks_ignored, 0);
    }

    #[test]
    fn test_run_accounting() {
        let metrics = Arc::new(Metrics::new());
        let mut ctx = ExecutionContext::new("USDTRY", None);
        ctx.record_error("average", "boom");
        ctx.record_skip("EURTRY");

        let first = metrics.run_started();
        let _second = metrics.run_started();
        assert_eq!(metrics.in_flight(), 2);
        metrics.run_finished(&ctx, true);
        drop(first);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_active, 1);
        assert_eq!(snapshot.runs_completed, 1);
        assert_eq!(snapshot.runs_over_budget, 1);
        assert_eq!(snapshot.stage_errors, 1);
        assert_eq!(snapshot.rules_skipped, 1);
    }

    #[test]
    fn test_active_run_released_on_unwind() {
        let metrics = Arc::new(Metrics::new());
        let shared = Arc::clone(&metrics);
        let result = std::panic::catch_unwind(move || {
            let _run = shared.run_started();
            panic!("worker died");
        });

        assert!(result.is_err());
        assert_eq!(metrics.in_flight(), 0);
        assert_eq!(metrics.snapshot().runs_completed, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.snapshot_published(5);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["snapshots_published"], 1);
        assert_eq!(json["snapshot_records"], 5);
    }
}
