//! Rate model shared by the aggregator, rule engine and pipeline.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::symbol;

/// Provider name carried by derived rates.
pub const CALCULATED_PROVIDER: &str = "CALCULATED";

/// Tier of a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateType {
    /// A single provider's unmodified quote.
    Raw,
    /// Consensus across a provider set.
    Average,
    /// Derived from other calculated rates.
    Cross,
    /// Status notification, not a price.
    Status,
}

impl RateType {
    /// Ordering key used when assembling snapshots.
    pub fn snapshot_priority(&self) -> u8 {
        match self {
            RateType::Raw => 0,
            RateType::Average => 1,
            RateType::Cross => 2,
            RateType::Status => 3,
        }
    }

    /// Whether the rate was produced by a calculation.
    pub fn is_derived(&self) -> bool {
        matches!(self, RateType::Average | RateType::Cross)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateType::Raw => "RAW",
            RateType::Average => "AVERAGE",
            RateType::Cross => "CROSS",
            RateType::Status => "STATUS",
        }
    }
}

impl fmt::Display for RateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a rate that contributed to a calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRateInfo {
    pub symbol: String,
    pub rate_type: RateType,
    pub provider_name: Option<String>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub timestamp: i64,
}

impl From<&Rate> for InputRateInfo {
    fn from(rate: &Rate) -> Self {
        Self {
            symbol: rate.symbol.clone(),
            rate_type: rate.rate_type,
            provider_name: rate.provider_name.clone(),
            bid: rate.bid,
            ask: rate.ask,
            timestamp: rate.timestamp,
        }
    }
}

/// A quote, raw or derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rate {
    /// Canonical or provider-qualified instrument id.
    pub symbol: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    /// Epoch milliseconds. For derived rates, the latest contributing timestamp.
    pub timestamp: i64,
    #[serde(default)]
    pub provider_name: Option<String>,
    pub rate_type: RateType,
    #[serde(default)]
    pub calculation_inputs: Vec<InputRateInfo>,
    #[serde(default)]
    pub calculated_by_strategy: Option<String>,
}

impl Rate {
    /// Create a raw provider quote.
    pub fn raw(
        provider: impl Into<String>,
        symbol: impl Into<String>,
        bid: Decimal,
        ask: Decimal,
        timestamp: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            bid: Some(bid),
            ask: Some(ask),
            timestamp,
            provider_name: Some(provider.into()),
            rate_type: RateType::Raw,
            calculation_inputs: Vec::new(),
            calculated_by_strategy: None,
        }
    }

    /// Create a derived rate produced by `strategy`.
    pub fn derived(
        symbol: impl Into<String>,
        rate_type: RateType,
        bid: Decimal,
        ask: Decimal,
        timestamp: i64,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            bid: Some(bid),
            ask: Some(ask),
            timestamp,
            provider_name: Some(CALCULATED_PROVIDER.to_string()),
            rate_type,
            calculation_inputs: Vec::new(),
            calculated_by_strategy: Some(strategy.into()),
        }
    }

    /// Attach the rates this one was calculated from.
    pub fn with_inputs(mut self, inputs: Vec<InputRateInfo>) -> Self {
        self.calculation_inputs = inputs;
        self
    }

    /// Whether both sides are quoted.
    pub fn is_two_sided(&self) -> bool {
        self.bid.is_some() && self.ask.is_some()
    }

    /// Mid price, if both sides are present.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Ask minus bid, if both sides are present.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Canonical 6-letter base symbol.
    pub fn base_symbol(&self) -> String {
        symbol::normalize(&self.symbol)
    }

    /// Provider name, or an empty string for anonymous rates.
    pub fn provider(&self) -> &str {
        self.provider_name.as_deref().unwrap_or("")
    }

    pub fn is_raw(&self) -> bool {
        self.rate_type == RateType::Raw
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: Option<Decimal>| v.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "{}[{}] {}/{} @{}",
            self.symbol,
            self.rate_type,
            side(self.bid),
            side(self.ask),
            self.timestamp
        )
    }
}
