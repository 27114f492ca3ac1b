//! Per-run execution context and the rate snapshot it accumulates.

use fxrelay_common::{symbol, PipelineId, Rate, RateType};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::aggregator::WindowBatch;

/// Error recorded by a stage. Never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub stage: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct StageTiming {
    pub stage: &'static str,
    pub elapsed: Duration,
}

/// Rates produced or consumed during one run, keyed for replacement.
///
/// Raw rates are keyed by provider and base symbol; calculated rates by their
/// symbol without any `CALC-` marker. Insertion order is kept.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    rates: Vec<Rate>,
    index: HashMap<String, usize>,
}

impl Snapshot {
    fn key(rate: &Rate) -> String {
        match rate.rate_type {
            RateType::Raw => format!("{}|{}", rate.provider(), rate.base_symbol()),
            _ => Self::calculated_key(&rate.symbol),
        }
    }

    fn calculated_key(symbol: &str) -> String {
        let upper = symbol.trim().to_uppercase();
        symbol::strip_calc_prefix(&upper).to_string()
    }

    /// Add a rate, replacing an earlier one with the same key in place.
    pub fn insert(&mut self, rate: Rate) {
        let key = Self::key(&rate);
        match self.index.get(&key) {
            Some(&idx) => self.rates[idx] = rate,
            None => {
                self.index.insert(key, self.rates.len());
                self.rates.push(rate);
            }
        }
    }

    /// Calculated rate stored under exactly `symbol`.
    pub fn get_calculated(&self, symbol: &str) -> Option<&Rate> {
        self.index
            .get(&Self::calculated_key(symbol))
            .map(|&idx| &self.rates[idx])
            .filter(|r| r.rate_type != RateType::Raw)
    }

    /// Calculated rate under `symbol` or any of its derived spellings.
    pub fn find_calculated(&self, symbol: &str) -> Option<&Rate> {
        self.get_calculated(symbol).or_else(|| {
            symbol::derived_variants(symbol)
                .iter()
                .find_map(|variant| self.get_calculated(variant))
        })
    }

    pub fn rates(&self) -> &[Rate] {
        &self.rates
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// State owned by one pipeline run.
#[derive(Debug)]
pub struct ExecutionContext {
    pub pipeline_id: PipelineId,
    pub base_symbol: String,
    pub triggering_rate: Option<Rate>,
    /// Cloned window contents, provider to rate.
    pub window_rates: HashMap<String, Rate>,
    pub snapshot: Snapshot,
    pub stage_errors: Vec<StageError>,
    pub stage_timings: Vec<StageTiming>,
    /// Output symbols not calculated this run for lack of inputs or strategy.
    pub skipped_rules: Vec<String>,
    /// Records published by snapshot assembly.
    pub published_records: Vec<String>,
    pub started_at: Instant,
}

impl ExecutionContext {
    pub fn new(base_symbol: impl Into<String>, triggering_rate: Option<Rate>) -> Self {
        Self {
            pipeline_id: PipelineId::new(),
            base_symbol: base_symbol.into(),
            triggering_rate,
            window_rates: HashMap::new(),
            snapshot: Snapshot::default(),
            stage_errors: Vec::new(),
            stage_timings: Vec::new(),
            skipped_rules: Vec::new(),
            published_records: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn from_batch(batch: WindowBatch) -> Self {
        let mut ctx = Self::new(batch.base_symbol, Some(batch.trigger));
        ctx.window_rates = batch.rates;
        ctx
    }

    pub fn record_error(&mut self, stage: &'static str, message: impl Into<String>) {
        self.stage_errors.push(StageError {
            stage,
            message: message.into(),
        });
    }

    pub fn record_skip(&mut self, output_symbol: &str) {
        self.skipped_rules.push(output_symbol.to_string());
    }

    pub fn has_errors(&self) -> bool {
        !self.stage_errors.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_replaces_by_key() {
        let mut snapshot = Snapshot::default();
        snapshot.insert(Rate::raw("PF1", "PF1_USDTRY", dec!(34.10), dec!(34.12), 1));
        snapshot.insert(Rate::raw("PF2", "PF2_USDTRY", dec!(34.08), dec!(34.14), 1));
        snapshot.insert(Rate::raw("PF1", "USD/TRY", dec!(34.11), dec!(34.13), 2));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.rates()[0].bid, Some(dec!(34.11)));
    }

    #[test]
    fn test_find_calculated_by_convention() {
        let mut snapshot = Snapshot::default();
        snapshot.insert(Rate::derived("USDTRY_AVG", RateType::Average, dec!(1), dec!(2), 1, "AVERAGE"));
        snapshot.insert(Rate::derived("CALC-EURTRY", RateType::Cross, dec!(3), dec!(4), 1, "FORMULA"));
        snapshot.insert(Rate::raw("PF1", "PF1_GBPUSD", dec!(1.2), dec!(1.3), 1));

        assert!(snapshot.get_calculated("usdtry_avg").is_some());
        assert!(snapshot.find_calculated("USD/TRY").is_some());
        assert_eq!(
            snapshot.find_calculated("EURTRY").map(|r| r.symbol.as_str()),
            Some("CALC-EURTRY")
        );
        assert!(snapshot.find_calculated("GBPUSD").is_none());
    }

    #[test]
    fn test_context_from_batch() {
        let trigger = Rate::raw("PF2", "PF2_USDTRY", dec!(34.08), dec!(34.14), 5);
        let mut rates = HashMap::new();
        rates.insert("PF2".to_string(), trigger.clone());
        let ctx = ExecutionContext::from_batch(WindowBatch {
            base_symbol: "USDTRY".into(),
            trigger,
            rates,
        });

        assert_eq!(ctx.base_symbol, "USDTRY");
        assert_eq!(ctx.window_rates.len(), 1);
        assert!(ctx.snapshot.is_empty());
        assert!(!ctx.has_errors());
    }
}
