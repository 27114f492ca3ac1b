//! Four-stage calculation pipeline.
//!
//! Every run creates its own [`ExecutionContext`] and passes it through raw
//! handling, average derivation, cross-rate derivation and snapshot assembly.
//! Stages always run in that order; an error or panic in one is recorded on
//! the context and the next stage runs anyway.

mod context;
mod stages;

pub use context::{ExecutionContext, Snapshot, StageError, StageTiming};
pub use stages::{
    format_snapshot, format_snapshot_record, snapshot_identifier, AverageStage, CalculationStage,
    CrossRateStage, RawDataStage, SnapshotAssemblyStage,
};

use async_trait::async_trait;
use futures::FutureExt;
use fxrelay_common::time;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::aggregator::{WindowBatch, WindowTrigger};
use crate::cache::SharedRateCache;
use crate::error::EngineResult;
use crate::providers::SymbolProviders;
use crate::publisher::SharedRatePublisher;
use crate::rules::RuleEngine;
use crate::strategy::DEFAULT_AVERAGE_SCALE;

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fractional digits of averaged rates.
    pub average_scale: u32,
    /// Fractional digits of bid/ask in snapshot records.
    pub snapshot_decimal_places: u32,
    /// Runs taking longer are logged.
    pub run_budget: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            average_scale: DEFAULT_AVERAGE_SCALE,
            snapshot_decimal_places: 5,
            run_budget: time::constants::pipeline_run_budget(),
        }
    }
}

/// Ordered stages run against one context per trigger.
pub struct CalculationPipeline {
    stages: Vec<Box<dyn CalculationStage>>,
    config: PipelineConfig,
}

impl CalculationPipeline {
    /// Standard four-stage pipeline.
    pub fn new(
        cache: SharedRateCache,
        publisher: SharedRatePublisher,
        rules: Arc<RuleEngine>,
        providers: SymbolProviders,
        config: PipelineConfig,
    ) -> Self {
        let stages: Vec<Box<dyn CalculationStage>> = vec![
            Box::new(RawDataStage::new(Arc::clone(&cache), Arc::clone(&publisher))),
            Box::new(AverageStage::new(
                Arc::clone(&cache),
                Arc::clone(&publisher),
                Arc::clone(&rules),
                providers,
            )),
            Box::new(CrossRateStage::new(
                Arc::clone(&cache),
                Arc::clone(&publisher),
                rules,
            )),
            Box::new(SnapshotAssemblyStage::new(publisher, config.snapshot_decimal_places)),
        ];
        Self::with_stages(stages, config)
    }

    /// Pipeline over custom stages.
    pub fn with_stages(stages: Vec<Box<dyn CalculationStage>>, config: PipelineConfig) -> Self {
        Self { stages, config }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage for a complete window.
    pub async fn run(&self, batch: WindowBatch) -> ExecutionContext {
        self.run_context(ExecutionContext::from_batch(batch)).await
    }

    /// Run every stage against `ctx`.
    #[instrument(skip(self, ctx), fields(pipeline_id = %ctx.pipeline_id, symbol = %ctx.base_symbol))]
    pub async fn run_context(&self, mut ctx: ExecutionContext) -> ExecutionContext {
        for stage in &self.stages {
            let started = Instant::now();
            match AssertUnwindSafe(stage.execute(&mut ctx)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(stage = stage.name(), error = %e, "Stage failed");
                    ctx.record_error(stage.name(), e.to_string());
                }
                Err(_) => {
                    error!(stage = stage.name(), "Stage panicked");
                    ctx.record_error(stage.name(), "stage panicked");
                }
            }
            let elapsed = started.elapsed();
            debug!(stage = stage.name(), elapsed_us = elapsed.as_micros() as u64, "Stage finished");
            ctx.stage_timings.push(StageTiming {
                stage: stage.name(),
                elapsed,
            });
        }

        let elapsed = ctx.elapsed();
        if elapsed > self.config.run_budget {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.config.run_budget.as_millis() as u64,
                "Pipeline run exceeded budget"
            );
        }
        info!(
            snapshot = ctx.snapshot.len(),
            records = ctx.published_records.len(),
            errors = ctx.stage_errors.len(),
            skipped = ctx.skipped_rules.len(),
            "Pipeline run complete"
        );
        ctx
    }
}

/// Runs the pipeline inline on the aggregator's task.
#[async_trait]
impl WindowTrigger for CalculationPipeline {
    async fn on_window_ready(&self, batch: WindowBatch) -> EngineResult<()> {
        self.run(batch).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryRateCache, RateCache};
    use crate::error::EngineError;
    use crate::providers::SymbolConfig;
    use crate::publisher::{ChannelPublisher, PublishedEvent};
    use crate::rules::{CalculationRule, RuleType, StrategyRegistry};
    use crate::strategy::{AverageStrategy, FormulaStrategy};
    use fxrelay_common::{Rate, RateType};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use tokio::sync::mpsc::UnboundedReceiver;

    const T0: i64 = 1_714_557_600_000;

    struct Harness {
        pipeline: CalculationPipeline,
        cache: Arc<InMemoryRateCache>,
        events: UnboundedReceiver<PublishedEvent>,
    }

    fn make_harness() -> Harness {
        let formula = Arc::new(FormulaStrategy::new("scripts"));
        formula
            .register_source(
                "eur_try.fx",
                "usd = rate(usdKey)\neur = rate(eurKey)\n\
                 bid = round(eur.bid * usd.mid, 5)\nask = round(eur.ask * usd.mid, 5)\n\
                 timestamp = max(usd.timestamp, eur.timestamp)",
            )
            .unwrap();

        let rules = Arc::new(RuleEngine::new(StrategyRegistry::with_defaults(
            AverageStrategy::default(),
            formula,
        )));
        rules
            .load_rules(vec![
                CalculationRule::new("USDTRY_AVG", RuleType::Avg).with_raw_sources(["USDTRY"]),
                CalculationRule::new("EURTRY", RuleType::Cross)
                    .with_required(["USDTRY_AVG", "EURUSD_AVG"])
                    .with_implementation("eur_try.fx")
                    .with_parameter("usdKey", "USDTRY_AVG")
                    .with_parameter("eurKey", "EURUSD_AVG")
                    .with_priority(10),
                CalculationRule::new("EURUSD_AVG", RuleType::Avg).with_raw_sources(["EURUSD"]),
            ])
            .unwrap();

        let providers = SymbolProviders::from_configs(&[SymbolConfig {
            base_symbol: "USDTRY".into(),
            expected_providers: vec!["PF1".into(), "PF2".into()],
        }]);

        let cache = Arc::new(InMemoryRateCache::new());
        let (publisher, events) = ChannelPublisher::new();
        let pipeline = CalculationPipeline::new(
            cache.clone(),
            Arc::new(publisher),
            rules,
            providers,
            PipelineConfig::default(),
        );
        Harness {
            pipeline,
            cache,
            events,
        }
    }

    fn make_batch() -> WindowBatch {
        let a = Rate::raw("PF1", "PF1_USDTRY", dec!(34.10), dec!(34.12), T0);
        let b = Rate::raw("PF2", "PF2_USDTRY", dec!(34.08), dec!(34.14), T0 + 500);
        let mut rates = HashMap::new();
        rates.insert("PF1".to_string(), a);
        rates.insert("PF2".to_string(), b.clone());
        WindowBatch {
            base_symbol: "USDTRY".into(),
            trigger: b,
            rates,
        }
    }

    fn snapshot_records(events: &mut UnboundedReceiver<PublishedEvent>) -> Vec<Vec<String>> {
        let mut snapshots = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PublishedEvent::Snapshot { records, .. } = event {
                snapshots.push(records);
            }
        }
        snapshots
    }

    #[tokio::test]
    async fn test_average_without_cross_inputs() {
        let mut h = make_harness();
        let ctx = h.pipeline.run(make_batch()).await;

        assert!(ctx.stage_errors.is_empty(), "{:?}", ctx.stage_errors);
        assert_eq!(ctx.skipped_rules, vec!["EURTRY".to_string()]);
        assert_eq!(ctx.stage_timings.len(), 4);

        let avg = ctx.snapshot.get_calculated("USDTRY_AVG").unwrap();
        assert_eq!(avg.bid, Some(dec!(34.09)));
        assert_eq!(avg.ask, Some(dec!(34.13)));
        assert_eq!(avg.timestamp, T0 + 500);
        assert!(h.cache.get_calculated_rate("USDTRY_AVG").await.unwrap().is_some());

        let snapshots = snapshot_records(&mut h.events);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            snapshots[0],
            vec![
                "PF1-USDTRY|34.10000|34.12000|2024-05-01T10:00:00.000Z",
                "PF2-USDTRY|34.08000|34.14000|2024-05-01T10:00:00.500Z",
                "USDTRY_AVG|34.09000|34.13000|2024-05-01T10:00:00.500Z",
            ]
        );
        assert_eq!(ctx.published_records, snapshots[0]);
    }

    #[tokio::test]
    async fn test_cross_completes_once_dependency_cached() {
        let mut h = make_harness();
        h.pipeline.run(make_batch()).await;

        h.cache
            .cache_calculated_rate(&Rate::derived(
                "EURUSD_AVG",
                RateType::Average,
                dec!(1.0800),
                dec!(1.0820),
                T0 + 100,
                "AVERAGE",
            ))
            .await
            .unwrap();

        let ctx = h.pipeline.run(make_batch()).await;
        assert!(ctx.skipped_rules.is_empty());
        let cross = ctx.snapshot.get_calculated("EURTRY").unwrap();
        assert_eq!(cross.bid, Some(dec!(36.83880)));
        assert_eq!(cross.ask, Some(dec!(36.90702)));
        assert!(ctx.snapshot.get_calculated("EURUSD_AVG").is_some());

        let last = snapshot_records(&mut h.events).pop().unwrap();
        assert_eq!(last.len(), 5);
        assert_eq!(last[4], "EURTRY|36.83880|36.90702|2024-05-01T10:00:00.500Z");
    }

    struct FailingStage;

    #[async_trait]
    impl CalculationStage for FailingStage {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> EngineResult<()> {
            Err(EngineError::Cache("unavailable".into()))
        }
    }

    struct CountingStage;

    #[async_trait]
    impl CalculationStage for CountingStage {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn execute(&self, ctx: &mut ExecutionContext) -> EngineResult<()> {
            ctx.record_skip("reached");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stage_error_does_not_stop_later_stages() {
        let pipeline = CalculationPipeline::with_stages(
            vec![Box::new(FailingStage), Box::new(CountingStage)],
            PipelineConfig::default(),
        );
        assert_eq!(pipeline.stage_names(), vec!["failing", "counting"]);

        let ctx = pipeline.run_context(ExecutionContext::new("USDTRY", None)).await;
        assert_eq!(ctx.stage_errors.len(), 1);
        assert_eq!(ctx.stage_errors[0].stage, "failing");
        assert_eq!(ctx.skipped_rules, vec!["reached".to_string()]);
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

    #[tokio::test]
    async fn test_stage_panic_does_not_stop_later_stages() {
        let pipeline = CalculationPipeline::with_stages(
            vec![Box::new(PanickingStage), Box::new(CountingStage)],
            PipelineConfig::default(),
        );

        let ctx = pipeline.run_context(ExecutionContext::new("USDTRY", None)).await;
        assert_eq!(ctx.stage_errors.len(), 1);
        assert_eq!(ctx.stage_errors[0].stage, "panicking");
        assert_eq!(ctx.stage_errors[0].message, "stage panicked");
        assert_eq!(ctx.skipped_rules, vec!["reached".to_string()]);
        assert_eq!(ctx.stage_timings.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_trigger_aborts_only_raw_stage() {
        let mut h = make_harness();
        let ctx = h.pipeline.run_context(ExecutionContext::new("USDTRY", None)).await;

        assert_eq!(ctx.stage_errors.len(), 1);
        assert_eq!(ctx.stage_errors[0].stage, RawDataStage::NAME);
        assert_eq!(ctx.stage_timings.len(), 4);
        // No window and an empty cache: nothing to average, nothing to publish.
        assert!(ctx.snapshot.is_empty());
        assert!(snapshot_records(&mut h.events).is_empty());
    }
}
