//! Wiring of the aggregation engine into a running node.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fxrelay_common::Rate;
use fxrelay_engine::{
    AcceptOutcome, AverageStrategy, CalculationPipeline, ChannelPublisher, FormulaStrategy,
    InMemoryRateCache, PublishedEvent, RateValidator, RuleConfig, RuleEngine, SharedRateCache,
    StrategyRegistry, SymbolProviders, WindowAggregator, WindowTrigger,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::NodeConfig;
use crate::dispatcher::PipelineDispatcher;
use crate::error::{NodeError, NodeResult};
use crate::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use crate::sink::SnapshotSink;
use crate::state::NodeState;

/// A running FX rate aggregation node.
pub struct RateService {
    config: NodeConfig,
    node_id: String,
    state: Arc<RwLock<NodeState>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    metrics: SharedMetrics,
    rules: Arc<RuleEngine>,
    providers: SymbolProviders,
    cache: Arc<InMemoryRateCache>,
    aggregator: Arc<WindowAggregator>,
    dispatcher: Arc<PipelineDispatcher>,
    sink: Arc<SnapshotSink>,
    events: Mutex<Option<UnboundedReceiver<PublishedEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    sink_task: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RateService {
    /// Build a node from the rule file named in `config`.
    pub fn new(config: NodeConfig, node_id: String) -> NodeResult<Self> {
        let rule_config = RuleConfig::load(&config.rules_path)?;
        Self::with_rule_config(config, node_id, rule_config)
    }

    /// Build a node from an already parsed rule configuration.
    pub fn with_rule_config(
        config: NodeConfig,
        node_id: String,
        rule_config: RuleConfig,
    ) -> NodeResult<Self> {
        config.validate().map_err(NodeError::Config)?;

        let formula = Arc::new(FormulaStrategy::new(config.script_root.clone()));
        let rules = Arc::new(RuleEngine::new(StrategyRegistry::with_defaults(
            AverageStrategy::new(config.pipeline.average_scale),
            formula,
        )));
        let providers = SymbolProviders::new();
        rule_config.apply(&rules, &providers)?;

        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(InMemoryRateCache::with_config(config.cache.clone()));
        let (publisher, events) = ChannelPublisher::new();

        let pipeline = Arc::new(CalculationPipeline::new(
            Arc::clone(&cache) as SharedRateCache,
            Arc::new(publisher),
            Arc::clone(&rules),
            providers.clone(),
            config.pipeline.clone(),
        ));
        let dispatcher = Arc::new(PipelineDispatcher::new(
            pipeline,
            config.workers,
            Arc::clone(&metrics),
            config.pipeline.run_budget,
        ));
        let aggregator = Arc::new(WindowAggregator::new(
            providers.clone(),
            RateValidator::new(config.validation.clone()),
            Arc::clone(&dispatcher) as Arc<dyn WindowTrigger>,
            config.aggregator.clone(),
        ));
        let sink = Arc::new(SnapshotSink::new(Arc::clone(&metrics)));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            node_id = %node_id,
            symbols = providers.len(),
            rules = rules.rule_set().len(),
            workers = config.workers,
            "Node assembled"
        );

        Ok(Self {
            config,
            node_id,
            state: Arc::new(RwLock::new(NodeState::Starting)),
            started_at: RwLock::new(None),
            metrics,
            rules,
            providers,
            cache,
            aggregator,
            dispatcher,
            sink,
            events: Mutex::new(Some(events)),
            shutdown_tx,
            sink_task: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start background tasks and begin accepting ticks.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(&self) -> NodeResult<()> {
        let current = self.state();
        if current != NodeState::Starting {
            return Err(NodeError::NotRunning(current));
        }

        if let Some(events) = self.events.lock().take() {
            let handle = self.spawn_sink(events);
            *self.sink_task.lock() = Some(handle);
        }

        let sweeper = self.aggregator.spawn_sweeper();
        let maintenance = self.spawn_maintenance();
        self.background.lock().extend([sweeper, maintenance]);

        *self.started_at.write() = Some(Utc::now());
        *self.state.write() = NodeState::Running;

        info!("Node started");
        Ok(())
    }

    /// Refuse new ticks, let in-flight runs finish, flush the sink.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn stop(&self) -> NodeResult<()> {
        info!("Stopping node");
        *self.state.write() = NodeState::ShuttingDown;

        if !self.dispatcher.drain(self.config.drain_timeout).await {
            warn!("Stopping with pipeline runs still in flight");
        }
        self.dispatcher.close();

        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        let _ = self.shutdown_tx.send(true);
        let sink_task = self.sink_task.lock().take();
        if let Some(handle) = sink_task {
            if let Err(e) = handle.await {
                warn!(error = %e, "Snapshot sink ended abnormally");
            }
        }

        *self.state.write() = NodeState::Stopped;

        let metrics = self.metrics.snapshot();
        info!(
            ticks = metrics.ticks_received,
            runs = metrics.runs_completed,
            snapshots = metrics.snapshots_published,
            "Node stopped"
        );
        Ok(())
    }

    /// Offer one tick to the aggregator.
    pub async fn ingest(&self, rate: Rate) -> NodeResult<AcceptOutcome> {
        let state = self.state();
        if !state.accepts_ticks() {
            return Err(NodeError::NotRunning(state));
        }
        let outcome = self.aggregator.accept(rate).await;
        self.metrics.tick(&outcome);
        Ok(outcome)
    }

    /// Replace rules and expected providers as a unit.
    pub fn reload_rules(&self, rule_config: &RuleConfig) -> NodeResult<()> {
        rule_config.apply(&self.rules, &self.providers)?;
        info!(
            symbols = self.providers.len(),
            rules = self.rules.rule_set().len(),
            "Rules reloaded"
        );
        Ok(())
    }

    /// Wait for every dispatched run to finish.
    pub async fn wait_idle(&self) -> bool {
        self.dispatcher.drain(self.config.drain_timeout).await
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Check if the node is accepting ticks.
    pub fn is_accepting_ticks(&self) -> bool {
        self.state().accepts_ticks()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn sink(&self) -> &Arc<SnapshotSink> {
        &self.sink
    }

    pub fn aggregator(&self) -> &Arc<WindowAggregator> {
        &self.aggregator
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn cache(&self) -> &Arc<InMemoryRateCache> {
        &self.cache
    }

    // --- Private methods ---

    fn spawn_sink(&self, mut events: UnboundedReceiver<PublishedEvent>) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => sink.consume(event),
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        while let Ok(event) = events.try_recv() {
                            sink.consume(event);
                        }
                        break;
                    }
                }
            }
        })
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        let aggregator = Arc::clone(&self.aggregator);
        let interval = self.config.maintenance_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                cache.evict_expired();
                let m = metrics.snapshot();
                info!(
                    ticks = m.ticks_received,
                    rejected = m.ticks_rejected,
                    windows = m.windows_triggered,
                    runs = m.runs_completed,
                    in_flight = m.runs_active,
                    over_budget = m.runs_over_budget,
                    stage_errors = m.stage_errors,
                    snapshots = m.snapshots_published,
                    cached = cache.len(),
                    buckets = aggregator.window_len(),
                    "Node metrics"
                );
            }
        })
    }
}
