//! Bounded worker pool for pipeline runs.
//!
//! Each complete window gets its own task and its own execution context. At
//! most `workers` runs execute at once; when the pool is saturated the
//! aggregator's `accept` waits for a permit, which pushes back on ingestion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fxrelay_engine::{CalculationPipeline, EngineError, EngineResult, WindowBatch, WindowTrigger};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::metrics::SharedMetrics;

/// Runs each triggered window on a pooled task.
pub struct PipelineDispatcher {
    pipeline: Arc<CalculationPipeline>,
    permits: Arc<Semaphore>,
    metrics: SharedMetrics,
    run_budget: Duration,
}

impl PipelineDispatcher {
    pub fn new(
        pipeline: Arc<CalculationPipeline>,
        workers: usize,
        metrics: SharedMetrics,
        run_budget: Duration,
    ) -> Self {
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            metrics,
            run_budget,
        }
    }

    /// Permits currently free.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop handing out permits. Runs already started finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Wait until no run is executing or `timeout` elapses.
    /// Returns whether the pool drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            while self.metrics.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(in_flight = self.metrics.in_flight(), "Pipeline runs still in flight after drain timeout");
        }
        drained
    }
}

#[async_trait]
impl WindowTrigger for PipelineDispatcher {
    async fn on_window_ready(&self, batch: WindowBatch) -> EngineResult<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Dispatch("worker pool closed".to_string()))?;

        self.metrics.window_triggered();
        let active = self.metrics.run_started();

        let pipeline = Arc::clone(&self.pipeline);
        let metrics = Arc::clone(&self.metrics);
        let budget = self.run_budget;
        let symbol = batch.base_symbol.clone();

        tokio::spawn(async move {
            let _active = active;
            let _permit = permit;
            let ctx = pipeline.run(batch).await;
            let over_budget = ctx.elapsed() > budget;
            debug!(
                pipeline_id = %ctx.pipeline_id,
                symbol = %symbol,
                elapsed_us = ctx.elapsed().as_micros() as u64,
                over_budget,
                "Worker finished run"
            );
            metrics.run_finished(&ctx, over_budget);
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use fxrelay_common::Rate;
    use fxrelay_engine::pipeline::CalculationStage;
    use fxrelay_engine::{ExecutionContext, PipelineConfig};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowStage {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CalculationStage for SlowStage {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> EngineResult<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_batch(symbol: &str) -> WindowBatch {
        let rate = Rate::raw("PF1", symbol, dec!(34.10), dec!(34.12), 1_000);
        let mut rates = HashMap::new();
        rates.insert("PF1".to_string(), rate.clone());
        WindowBatch {
            base_symbol: symbol.to_string(),
            trigger: rate,
            rates,
        }
    }

    struct PanickingStage;

    #[async_trait]
    impl CalculationStage for PanickingStage {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> EngineResult<()> {
            panic!("strategy blew up");
        }
    }

    fn make_dispatcher(workers: usize) -> (PipelineDispatcher, Arc<AtomicUsize>, SharedMetrics) {
        let calls = Arc::new(AtomicUsize::new(0));
        let stages: Vec<Box<dyn CalculationStage>> = vec![Box::new(SlowStage {
            calls: Arc::clone(&calls),
        })];
        make_dispatcher_with(stages, workers, calls)
    }

    fn make_dispatcher_with(
        stages: Vec<Box<dyn CalculationStage>>,
        workers: usize,
        calls: Arc<AtomicUsize>,
    ) -> (PipelineDispatcher, Arc<AtomicUsize>, SharedMetrics) {
        let pipeline = Arc::new(CalculationPipeline::with_stages(stages, PipelineConfig::default()));
        let metrics = Arc::new(Metrics::new());
        let dispatcher = PipelineDispatcher::new(
            pipeline,
            workers,
            Arc::clone(&metrics),
            Duration::from_millis(500),
        );
        (dispatcher, calls, metrics)
    }

    #[tokio::test]
    async fn test_runs_each_window_on_a_worker() {
        let (dispatcher, calls, metrics) = make_dispatcher(2);

        for symbol in ["USDTRY", "EURUSD", "GBPUSD"] {
            dispatcher.on_window_ready(make_batch(symbol)).await.unwrap();
        }

        assert!(dispatcher.drain(Duration::from_secs(2)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.windows_triggered, 3);
        assert_eq!(snapshot.runs_completed, 3);
        assert_eq!(snapshot.runs_active, 0);
        assert_eq!(dispatcher.idle_workers(), 2);
    }

    #[tokio::test]
    async fn test_panicking_stage_releases_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stages: Vec<Box<dyn CalculationStage>> = vec![
            Box::new(PanickingStage),
            Box::new(SlowStage {
                calls: Arc::clone(&calls),
            }),
        ];
        let (dispatcher, calls, metrics) = make_dispatcher_with(stages, 1, calls);

        tokio_test::assert_ok!(dispatcher.on_window_ready(make_batch("USDTRY")).await);
        tokio_test::assert_ok!(dispatcher.on_window_ready(make_batch("EURUSD")).await);

        assert!(dispatcher.drain(Duration::from_secs(2)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_active, 0);
        assert_eq!(snapshot.runs_completed, 2);
        assert_eq!(snapshot.stage_errors, 2);
        assert_eq!(dispatcher.idle_workers(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_windows() {
        let (dispatcher, calls, _metrics) = make_dispatcher(1);
        dispatcher.close();

        let err = tokio_test::assert_err!(dispatcher.on_window_ready(make_batch("USDTRY")).await);
        assert!(matches!(err, EngineError::Dispatch(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
