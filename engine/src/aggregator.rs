//! Time-windowed multi-provider aggregation.
//!
//! Raw ticks are bucketed by base symbol and provider. When every expected
//! provider has a quote in the bucket and the quotes lie within the skew
//! threshold, a cloned batch is handed to the [`WindowTrigger`]. Buckets are
//! never cleared on trigger; only the stale sweep removes entries.

use async_trait::async_trait;
use dashmap::DashMap;
use fxrelay_common::{time, Rate, RateError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::EngineResult;
use crate::providers::SymbolProviders;
use crate::validation::RateValidator;

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Maximum newest-minus-oldest timestamp across a complete window.
    pub max_time_skew_ms: i64,
    /// Entries older than `max_time_skew_ms * stale_multiplier` are swept.
    pub stale_multiplier: i64,
    /// Interval between sweeps.
    pub sweep_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_time_skew_ms: time::constants::DEFAULT_MAX_TIME_SKEW_MS,
            stale_multiplier: time::constants::DEFAULT_STALE_MULTIPLIER,
            sweep_interval: time::constants::sweep_interval(),
        }
    }
}

impl AggregatorConfig {
    /// Age beyond which a window entry is considered stale.
    pub fn stale_after_ms(&self) -> i64 {
        self.max_time_skew_ms.saturating_mul(self.stale_multiplier)
    }
}

/// A complete, skew-checked window handed downstream.
#[derive(Debug, Clone)]
pub struct WindowBatch {
    pub base_symbol: String,
    /// The tick that completed the window.
    pub trigger: Rate,
    /// Provider name to cloned rate.
    pub rates: HashMap<String, Rate>,
}

/// Receives complete windows.
#[async_trait]
pub trait WindowTrigger: Send + Sync {
    async fn on_window_ready(&self, batch: WindowBatch) -> EngineResult<()>;
}

/// Result of offering a tick to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    /// Not a raw rate.
    Ignored,
    /// Failed validation.
    Rejected(RateError),
    /// No expected providers configured for the symbol.
    Unconfigured,
    /// Stored; still waiting for other providers.
    Buffered { collected: usize, expected: usize },
    /// Complete, but quotes are too far apart.
    SkewExceeded { skew_ms: i64 },
    /// Complete and handed to the trigger.
    Triggered { providers: usize },
}

#[derive(Debug, Clone)]
struct WindowEntry {
    rate: Rate,
    last_used: Option<i64>,
}

impl WindowEntry {
    fn is_stale(&self, cutoff: i64) -> bool {
        self.rate.timestamp < cutoff || self.last_used.map_or(false, |used| used < cutoff)
    }
}

/// Buffers raw ticks per base symbol and triggers on complete windows.
pub struct WindowAggregator {
    window: DashMap<String, HashMap<String, WindowEntry>>,
    providers: SymbolProviders,
    validator: RateValidator,
    trigger: Arc<dyn WindowTrigger>,
    config: AggregatorConfig,
}

impl WindowAggregator {
    pub fn new(
        providers: SymbolProviders,
        validator: RateValidator,
        trigger: Arc<dyn WindowTrigger>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            window: DashMap::new(),
            providers,
            validator,
            trigger,
            config,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Offer a tick.
    pub async fn accept(&self, rate: Rate) -> AcceptOutcome {
        if !rate.is_raw() {
            trace!(symbol = %rate.symbol, rate_type = %rate.rate_type, "Ignoring non-raw rate");
            return AcceptOutcome::Ignored;
        }

        if let Err(e) = self.validator.validate(&rate) {
            warn!(symbol = %rate.symbol, provider = rate.provider(), code = e.code(), error = %e, "Rejected raw rate");
            return AcceptOutcome::Rejected(e);
        }

        let base_symbol = rate.base_symbol();
        let provider = rate.provider().to_string();

        let (outcome, batch) = self.store_and_check(&base_symbol, provider, rate);

        if let Some(batch) = batch {
            if let Err(e) = self.trigger.on_window_ready(batch).await {
                error!(symbol = %base_symbol, error = %e, "Window trigger failed");
            }
        }

        outcome
    }

    /// Insert the tick and, if the window is complete and within skew, build
    /// the batch. The bucket lock is released before returning.
    fn store_and_check(
        &self,
        base_symbol: &str,
        provider: String,
        rate: Rate,
    ) -> (AcceptOutcome, Option<WindowBatch>) {
        let mut bucket = self.window.entry(base_symbol.to_string()).or_default();
        bucket.insert(
            provider,
            WindowEntry {
                rate: rate.clone(),
                last_used: None,
            },
        );

        let Some(expected) = self.providers.get(base_symbol).filter(|p| !p.is_empty()) else {
            debug!(symbol = %base_symbol, "No expected providers configured");
            return (AcceptOutcome::Unconfigured, None);
        };

        let collected = expected.iter().filter(|p| bucket.contains_key(*p)).count();
        if collected < expected.len() {
            debug!(
                symbol = %base_symbol,
                collected,
                expected = expected.len(),
                "Waiting for providers"
            );
            return (
                AcceptOutcome::Buffered {
                    collected,
                    expected: expected.len(),
                },
                None,
            );
        }

        let skew_ms = time::skew_millis(
            expected
                .iter()
                .filter_map(|p| bucket.get(p))
                .map(|e| e.rate.timestamp),
        );
        if skew_ms > self.config.max_time_skew_ms {
            info!(
                symbol = %base_symbol,
                skew_ms,
                max_skew_ms = self.config.max_time_skew_ms,
                "Window skew exceeded, waiting for fresher tick"
            );
            return (AcceptOutcome::SkewExceeded { skew_ms }, None);
        }

        let now = time::now_millis();
        let mut rates = HashMap::with_capacity(expected.len());
        for p in &expected {
            if let Some(entry) = bucket.get_mut(p) {
                entry.last_used = Some(now);
                rates.insert(p.clone(), entry.rate.clone());
            }
        }
        drop(bucket);

        debug!(symbol = %base_symbol, providers = rates.len(), skew_ms, "Window complete");
        let providers = rates.len();
        (
            AcceptOutcome::Triggered { providers },
            Some(WindowBatch {
                base_symbol: base_symbol.to_string(),
                trigger: rate,
                rates,
            }),
        )
    }

    /// Remove stale entries relative to the current clock.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(time::now_millis())
    }

    /// Remove every entry whose timestamp or last use is older than the stale
    /// cutoff, then drop empty buckets. Returns the number of entries removed.
    pub fn sweep_stale_at(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - self.config.stale_after_ms();
        let mut removed = 0;

        self.window.retain(|symbol, bucket| {
            let before = bucket.len();
            bucket.retain(|_, entry| !entry.is_stale(cutoff));
            let dropped = before - bucket.len();
            if dropped > 0 {
                debug!(symbol = %symbol, dropped, "Swept stale window entries");
            }
            removed += dropped;
            !bucket.is_empty()
        });

        if removed > 0 {
            info!(removed, buckets = self.window.len(), "Stale window sweep");
        }
        removed
    }

    /// Spawn the periodic sweep on the runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            aggregator.run_sweep_loop().await;
        })
    }

    /// Sweep forever at the configured interval.
    pub async fn run_sweep_loop(&self) {
        loop {
            tokio::time::sleep(self.config.sweep_interval).await;
            self.sweep_stale();
        }
    }

    /// Number of symbol buckets.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Providers currently buffered for a symbol, sorted.
    pub fn providers_for(&self, symbol: &str) -> Vec<String> {
        let base = fxrelay_common::symbol::normalize(symbol);
        let mut providers: Vec<String> = self
            .window
            .get(&base)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default();
        providers.sort();
        providers
    }

    /// Buffered rate of one provider for a symbol.
    pub fn buffered_rate(&self, symbol: &str, provider: &str) -> Option<Rate> {
        let base = fxrelay_common::symbol::normalize(symbol);
        self.window
            .get(&base)
            .and_then(|bucket| bucket.get(provider).map(|e| e.rate.clone()))
    }

    /// Providers expected for a symbol.
    pub fn expected_providers(&self, symbol: &str) -> Vec<String> {
        self.providers.get(symbol).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::providers::SymbolConfig;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingTrigger {
        batches: Mutex<Vec<WindowBatch>>,
        fail: bool,
    }

    #[async_trait]
    impl WindowTrigger for RecordingTrigger {
        async fn on_window_ready(&self, batch: WindowBatch) -> EngineResult<()> {
            self.batches.lock().push(batch);
            if self.fail {
                return Err(EngineError::Publish("boom".into()));
            }
            Ok(())
        }
    }

    fn make_aggregator(trigger: Arc<RecordingTrigger>) -> WindowAggregator {
        let providers = SymbolProviders::from_configs(&[SymbolConfig {
            base_symbol: "USDTRY".into(),
            expected_providers: vec!["PF1".into(), "PF2".into()],
        }]);
        WindowAggregator::new(
            providers,
            RateValidator::default(),
            trigger,
            AggregatorConfig::default(),
        )
    }

    fn make_tick(provider: &str, bid: Decimal, ask: Decimal, ts: i64) -> Rate {
        Rate::raw(provider, format!("{provider}_USDTRY"), bid, ask, ts)
    }

    #[tokio::test]
    async fn test_triggers_once_all_providers_present() {
        let trigger = Arc::new(RecordingTrigger::default());
        let aggregator = make_aggregator(trigger.clone());
        let t0 = time::now_millis();

        let first = aggregator.accept(make_tick("PF1", dec!(34.10), dec!(34.12), t0)).await;
        assert_eq!(first, AcceptOutcome::Buffered { collected: 1, expected: 2 });
        assert!(trigger.batches.lock().is_empty());

        let second = aggregator
            .accept(make_tick("PF2", dec!(34.08), dec!(34.14), t0 + 500))
            .await;
        assert_eq!(second, AcceptOutcome::Triggered { providers: 2 });

        let batches = trigger.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].base_symbol, "USDTRY");
        assert_eq!(batches[0].trigger.provider(), "PF2");
        assert_eq!(batches[0].rates["PF1"].bid, Some(dec!(34.10)));
    }

    #[tokio::test]
    async fn test_window_kept_after_trigger() {
        let trigger = Arc::new(RecordingTrigger::default());
        let aggregator = make_aggregator(trigger.clone());
        let t0 = time::now_millis();

        aggregator.accept(make_tick("PF1", dec!(34.10), dec!(34.12), t0)).await;
        aggregator.accept(make_tick("PF2", dec!(34.08), dec!(34.14), t0)).await;
        aggregator.accept(make_tick("PF1", dec!(34.11), dec!(34.13), t0 + 100)).await;

        assert_eq!(aggregator.providers_for("USDTRY"), vec!["PF1", "PF2"]);
        assert_eq!(trigger.batches.lock().len(), 2);
        assert_eq!(
            aggregator.buffered_rate("USDTRY", "PF1").and_then(|r| r.bid),
            Some(dec!(34.11))
        );
    }

    #[tokio::test]
    async fn test_skew_blocks_until_fresher_tick() {
        let trigger = Arc::new(RecordingTrigger::default());
        let aggregator = make_aggregator(trigger.clone());
        let t0 = time::now_millis() - 5_000;

        aggregator.accept(make_tick("PF1", dec!(34.10), dec!(34.12), t0)).await;
        let outcome = aggregator
            .accept(make_tick("PF2", dec!(34.08), dec!(34.14), t0 + 3_500))
            .await;
        assert_eq!(outcome, AcceptOutcome::SkewExceeded { skew_ms: 3_500 });
        assert!(trigger.batches.lock().is_empty());

        let outcome = aggregator
            .accept(make_tick("PF1", dec!(34.10), dec!(34.12), t0 + 3_000))
            .await;
        assert_eq!(outcome, AcceptOutcome::Triggered { providers: 2 });
        assert_eq!(trigger.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_non_raw_and_invalid_rates() {
        let trigger = Arc::new(RecordingTrigger::default());
        let aggregator = make_aggregator(trigger.clone());
        let now = time::now_millis();

        let derived = Rate::derived(
            "USDTRY_AVG",
            fxrelay_common::RateType::Average,
            dec!(1),
            dec!(2),
            now,
            "AVERAGE",
        );
        assert_eq!(aggregator.accept(derived).await, AcceptOutcome::Ignored);

        let crossed = make_tick("PF1", dec!(34.20), dec!(34.10), now);
        assert!(matches!(
            aggregator.accept(crossed).await,
            AcceptOutcome::Rejected(RateError::BidAboveAsk { .. })
        ));
        assert_eq!(aggregator.window_len(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_symbol_is_buffered_without_trigger() {
        let trigger = Arc::new(RecordingTrigger::default());
        let aggregator = make_aggregator(trigger.clone());
        let rate = Rate::raw("PF1", "PF1_EURUSD", dec!(1.08), dec!(1.082), time::now_millis());

        assert_eq!(aggregator.accept(rate).await, AcceptOutcome::Unconfigured);
        assert_eq!(aggregator.providers_for("EURUSD"), vec!["PF1"]);
        assert!(aggregator.expected_providers("EURUSD").is_empty());
    }

    #[tokio::test]
    async fn test_trigger_error_does_not_stop_aggregator() {
        let trigger = Arc::new(RecordingTrigger {
            fail: true,
            ..Default::default()
        });
        let aggregator = make_aggregator(trigger.clone());
        let t0 = time::now_millis();

        aggregator.accept(make_tick("PF1", dec!(34.10), dec!(34.12), t0)).await;
        let outcome = aggregator.accept(make_tick("PF2", dec!(34.08), dec!(34.14), t0)).await;
        assert_eq!(outcome, AcceptOutcome::Triggered { providers: 2 });

        let outcome = aggregator.accept(make_tick("PF2", dec!(34.09), dec!(34.14), t0)).await;
        assert_eq!(outcome, AcceptOutcome::Triggered { providers: 2 });
        assert_eq!(trigger.batches.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_entries_and_empty_buckets() {
        let trigger = Arc::new(RecordingTrigger::default());
        let aggregator = make_aggregator(trigger.clone());
        let t0 = time::now_millis();

        aggregator.accept(make_tick("PF1", dec!(34.10), dec!(34.12), t0)).await;
        assert_eq!(aggregator.sweep_stale_at(t0 + 29_000), 0);
        assert_eq!(aggregator.window_len(), 1);

        assert_eq!(aggregator.sweep_stale_at(t0 + 30_001), 1);
        assert_eq!(aggregator.window_len(), 0);
        assert!(aggregator.providers_for("USDTRY").is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_entries_last_used_long_ago() {
        let trigger = Arc::new(RecordingTrigger::default());
        let aggregator = make_aggregator(trigger.clone());
        let t0 = time::now_millis();
        // Timestamps ahead of the clock stay fresh past the sweep cutoff.
        let ts = t0 + 9_000;
        let sweep_at = t0 + 31_000;

        aggregator.accept(make_tick("PF1", dec!(34.10), dec!(34.12), ts)).await;
        assert_eq!(aggregator.sweep_stale_at(sweep_at), 0);
        assert_eq!(aggregator.providers_for("USDTRY"), vec!["PF1"]);

        let outcome = aggregator.accept(make_tick("PF2", dec!(34.08), dec!(34.14), ts)).await;
        assert_eq!(outcome, AcceptOutcome::Triggered { providers: 2 });

        assert_eq!(aggregator.sweep_stale_at(sweep_at), 2);
        assert_eq!(aggregator.window_len(), 0);
    }

    #[test]
    fn test_entry_staleness() {
        let cutoff = 1_000;
        let entry = |ts: i64, last_used: Option<i64>| WindowEntry {
            rate: make_tick("PF1", dec!(34.10), dec!(34.12), ts),
            last_used,
        };

        assert!(!entry(2_000, None).is_stale(cutoff));
        assert!(!entry(2_000, Some(1_500)).is_stale(cutoff));
        assert!(entry(999, None).is_stale(cutoff));
        assert!(entry(2_000, Some(999)).is_stale(cutoff));
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_provider_in_bucket() {
        let trigger = Arc::new(RecordingTrigger::default());
        let aggregator = make_aggregator(trigger.clone());
        let t0 = time::now_millis();

        aggregator.accept(make_tick("PF1", dec!(34.10), dec!(34.12), t0 - 40_000)).await;
        aggregator.accept(make_tick("PF2", dec!(34.08), dec!(34.14), t0)).await;

        assert_eq!(aggregator.sweep_stale_at(t0), 1);
        assert_eq!(aggregator.providers_for("USDTRY"), vec!["PF2"]);
    }
}
