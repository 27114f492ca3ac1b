//! The four pipeline stages.

use async_trait::async_trait;
use fxrelay_common::{symbol, time, Rate, RateType};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::context::ExecutionContext;
use crate::cache::SharedRateCache;
use crate::error::{EngineError, EngineResult};
use crate::providers::SymbolProviders;
use crate::publisher::SharedRatePublisher;
use crate::rules::{CalculationRule, RuleEngine, RuleType};

/// One step of a pipeline run.
///
/// A returned error is recorded on the context; later stages still run.
#[async_trait]
pub trait CalculationStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut ExecutionContext) -> EngineResult<()>;
}

/// Cache, publish and snapshot a freshly calculated rate.
async fn store_calculated(
    stage: &'static str,
    cache: &SharedRateCache,
    publisher: &SharedRatePublisher,
    ctx: &mut ExecutionContext,
    rate: Rate,
) {
    if let Err(e) = cache.cache_calculated_rate(&rate).await {
        ctx.record_error(stage, format!("cache {}: {}", rate.symbol, e));
    }
    if let Err(e) = publisher.publish_calculated_rate(&rate).await {
        ctx.record_error(stage, format!("publish {}: {}", rate.symbol, e));
    }
    ctx.snapshot.insert(rate);
}

/// Evaluate a rule and store its output, classifying failures.
async fn calculate_rule(
    stage: &'static str,
    rules: &RuleEngine,
    cache: &SharedRateCache,
    publisher: &SharedRatePublisher,
    ctx: &mut ExecutionContext,
    rule: &CalculationRule,
    inputs: &HashMap<String, Rate>,
) {
    match rules.evaluate(rule, inputs) {
        Ok(rate) => {
            debug!(
                pipeline_id = %ctx.pipeline_id,
                output = %rate.symbol,
                bid = ?rate.bid,
                ask = ?rate.ask,
                "Rule calculated"
            );
            store_calculated(stage, cache, publisher, ctx, rate).await;
        }
        Err(e) if e.is_incomplete_input() => {
            debug!(pipeline_id = %ctx.pipeline_id, output = %rule.output_symbol, "Rule skipped: {}", e);
            ctx.record_skip(&rule.output_symbol);
        }
        Err(e) => {
            warn!(pipeline_id = %ctx.pipeline_id, output = %rule.output_symbol, error = %e, "Rule failed");
            ctx.record_error(stage, e.to_string());
        }
    }
}

/// Stage 1: cache, publish and snapshot the triggering raw rate.
pub struct RawDataStage {
    cache: SharedRateCache,
    publisher: SharedRatePublisher,
}

impl RawDataStage {
    pub const NAME: &'static str = "raw-data";

    pub fn new(cache: SharedRateCache, publisher: SharedRatePublisher) -> Self {
        Self { cache, publisher }
    }
}

#[async_trait]
impl CalculationStage for RawDataStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> EngineResult<()> {
        let rate = ctx.triggering_rate.clone().ok_or(EngineError::MissingTrigger)?;

        if let Err(e) = self.cache.cache_raw_rate(&rate).await {
            ctx.record_error(Self::NAME, format!("cache {}: {}", rate.symbol, e));
        }
        if let Err(e) = self.publisher.publish_raw_rate(&rate).await {
            ctx.record_error(Self::NAME, format!("publish {}: {}", rate.symbol, e));
        }
        ctx.snapshot.insert(rate);
        Ok(())
    }
}

/// Stage 2: AVG rules fed by the triggering symbol.
pub struct AverageStage {
    cache: SharedRateCache,
    publisher: SharedRatePublisher,
    rules: Arc<RuleEngine>,
    providers: SymbolProviders,
}

impl AverageStage {
    pub const NAME: &'static str = "average";

    pub fn new(
        cache: SharedRateCache,
        publisher: SharedRatePublisher,
        rules: Arc<RuleEngine>,
        providers: SymbolProviders,
    ) -> Self {
        Self {
            cache,
            publisher,
            rules,
            providers,
        }
    }

    /// Provider rates for one raw source: window first, cache for the rest.
    async fn source_rates(&self, ctx: &ExecutionContext, source: &str) -> EngineResult<HashMap<String, Rate>> {
        let base = symbol::normalize(source);
        let expected = self.providers.get(&base).unwrap_or_default();
        let mut found: HashMap<String, Rate> = HashMap::new();

        if base == ctx.base_symbol {
            found.extend(
                ctx.window_rates
                    .iter()
                    .filter(|(p, _)| expected.is_empty() || expected.contains(p))
                    .map(|(p, r)| (p.clone(), r.clone())),
            );
        }

        let missing: Vec<String> = expected
            .iter()
            .filter(|p| !found.contains_key(*p))
            .cloned()
            .collect();
        if !missing.is_empty() {
            found.extend(self.cache.get_raw_rates_for_symbol(&base, &missing).await?);
        }
        Ok(found)
    }

    async fn collect_inputs(
        &self,
        ctx: &mut ExecutionContext,
        rule: &CalculationRule,
    ) -> HashMap<String, Rate> {
        let qualify = rule.raw_sources.len() > 1;
        let mut inputs = HashMap::new();

        for source in &rule.raw_sources {
            match self.source_rates(ctx, source).await {
                Ok(rates) => {
                    for (provider, rate) in rates {
                        let key = if qualify {
                            symbol::provider_qualified(&provider, source)
                        } else {
                            provider
                        };
                        inputs.insert(key, rate);
                    }
                }
                Err(e) => ctx.record_error(Self::NAME, format!("inputs for {}: {}", rule.output_symbol, e)),
            }
        }
        inputs
    }
}

#[async_trait]
impl CalculationStage for AverageStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> EngineResult<()> {
        let set = self.rules.rule_set();
        let trigger_symbol = ctx
            .triggering_rate
            .as_ref()
            .map(|r| r.symbol.clone())
            .unwrap_or_else(|| ctx.base_symbol.clone());

        for rule in set.avg_rules_for(&trigger_symbol) {
            if !self.rules.has_strategy(rule) {
                ctx.record_skip(&rule.output_symbol);
                continue;
            }

            let inputs = self.collect_inputs(ctx, rule).await;
            if inputs.is_empty() {
                ctx.record_skip(&rule.output_symbol);
                continue;
            }
            for rate in inputs.values() {
                ctx.snapshot.insert(rate.clone());
            }

            calculate_rule(Self::NAME, &self.rules, &self.cache, &self.publisher, ctx, rule, &inputs).await;
        }
        Ok(())
    }
}

/// Stage 3: every CROSS rule whose inputs are available.
pub struct CrossRateStage {
    cache: SharedRateCache,
    publisher: SharedRatePublisher,
    rules: Arc<RuleEngine>,
}

impl CrossRateStage {
    pub const NAME: &'static str = "cross-rate";

    pub fn new(cache: SharedRateCache, publisher: SharedRatePublisher, rules: Arc<RuleEngine>) -> Self {
        Self {
            cache,
            publisher,
            rules,
        }
    }

    /// Snapshot first, then the cache under each spelling. Cache hits are
    /// added to the snapshot.
    async fn resolve(&self, ctx: &mut ExecutionContext, required: &str) -> Option<Rate> {
        if let Some(rate) = ctx.snapshot.find_calculated(required) {
            return Some(rate.clone());
        }

        let mut candidates = vec![required.trim().to_uppercase()];
        for variant in symbol::derived_variants(required) {
            if !candidates.contains(&variant) {
                candidates.push(variant);
            }
        }

        for candidate in candidates {
            match self.cache.get_calculated_rate(&candidate).await {
                Ok(Some(rate)) => {
                    ctx.snapshot.insert(rate.clone());
                    return Some(rate);
                }
                Ok(None) => {}
                Err(e) => {
                    ctx.record_error(Self::NAME, format!("cache lookup {}: {}", candidate, e));
                    return None;
                }
            }
        }
        None
    }
}

#[async_trait]
impl CalculationStage for CrossRateStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> EngineResult<()> {
        let set = self.rules.rule_set();

        for rule in set.of_type(RuleType::Cross) {
            if !self.rules.has_strategy(rule) {
                ctx.record_skip(&rule.output_symbol);
                continue;
            }

            let mut inputs = HashMap::with_capacity(rule.required_calculated_rates.len());
            let mut missing = None;
            for required in &rule.required_calculated_rates {
                match self.resolve(ctx, required).await {
                    Some(rate) => {
                        inputs.insert(required.clone(), rate);
                    }
                    None => {
                        missing = Some(required.clone());
                        break;
                    }
                }
            }

            if let Some(input) = missing {
                debug!(
                    pipeline_id = %ctx.pipeline_id,
                    output = %rule.output_symbol,
                    input = %input,
                    "Cross rule waiting for input"
                );
                ctx.record_skip(&rule.output_symbol);
                continue;
            }

            calculate_rule(Self::NAME, &self.rules, &self.cache, &self.publisher, ctx, rule, &inputs).await;
        }
        Ok(())
    }
}

/// Stage 4: order, format and publish the snapshot.
pub struct SnapshotAssemblyStage {
    publisher: SharedRatePublisher,
    decimal_places: u32,
}

impl SnapshotAssemblyStage {
    pub const NAME: &'static str = "snapshot-assembly";

    pub fn new(publisher: SharedRatePublisher, decimal_places: u32) -> Self {
        Self {
            publisher,
            decimal_places,
        }
    }
}

#[async_trait]
impl CalculationStage for SnapshotAssemblyStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip(self, ctx), fields(pipeline_id = %ctx.pipeline_id))]
    async fn execute(&self, ctx: &mut ExecutionContext) -> EngineResult<()> {
        if ctx.snapshot.is_empty() {
            debug!("Empty snapshot, nothing to publish");
            return Ok(());
        }

        let records = format_snapshot(ctx.snapshot.rates(), self.decimal_places);
        self.publisher
            .publish_immediate_snapshot(records.clone(), ctx.pipeline_id)
            .await?;
        ctx.published_records = records;
        Ok(())
    }
}

/// Identifier written in a snapshot record: `provider-SYMBOL` for raw
/// rates, the symbol without any `CALC-` marker otherwise.
pub fn snapshot_identifier(rate: &Rate) -> String {
    match rate.rate_type {
        RateType::Raw => format!("{}-{}", rate.provider(), rate.base_symbol()),
        _ => symbol::strip_calc_prefix(&rate.symbol).to_string(),
    }
}

fn format_price(value: Option<Decimal>, decimal_places: u32) -> String {
    match value {
        Some(v) => {
            let mut rounded = v.round_dp_with_strategy(decimal_places, RoundingStrategy::MidpointAwayFromZero);
            rounded.rescale(decimal_places);
            rounded.to_string()
        }
        None => String::new(),
    }
}

/// `IDENTIFIER|BID|ASK|ISO8601_TIMESTAMP`
pub fn format_snapshot_record(rate: &Rate, decimal_places: u32) -> String {
    format!(
        "{}|{}|{}|{}",
        snapshot_identifier(rate),
        format_price(rate.bid, decimal_places),
        format_price(rate.ask, decimal_places),
        time::to_iso(rate.timestamp)
    )
}

/// Sort by tier, then timestamp, then identifier, and format every rate.
pub fn format_snapshot(rates: &[Rate], decimal_places: u32) -> Vec<String> {
    let mut ordered: Vec<(&Rate, String)> = rates.iter().map(|r| (r, snapshot_identifier(r))).collect();
    ordered.sort_by(|(a, a_id), (b, b_id)| {
        a.rate_type
            .snapshot_priority()
            .cmp(&b.rate_type.snapshot_priority())
            .then(a.timestamp.cmp(&b.timestamp))
            .then_with(|| a_id.cmp(b_id))
    });
    ordered
        .into_iter()
        .map(|(rate, _)| format_snapshot_record(rate, decimal_places))
        .collect()
}
