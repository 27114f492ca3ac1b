//! Raw rate validation applied before a tick enters the window.

use fxrelay_common::{symbol, time, Rate, RateError};
use rust_decimal::Decimal;

/// Limits a raw rate must respect.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Disable to accept every two-sided rate unchecked.
    pub enabled: bool,
    /// Maximum `(ask - bid) / bid`.
    pub max_spread_ratio: Decimal,
    /// Maximum age of a rate relative to the local clock.
    pub max_age_ms: i64,
    /// How far in the future a timestamp may lie.
    pub future_tolerance_ms: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_spread_ratio: Decimal::new(5, 2),
            max_age_ms: 300_000,
            future_tolerance_ms: 10_000,
        }
    }
}

/// Checks raw rates against [`ValidationConfig`].
#[derive(Debug, Clone, Default)]
pub struct RateValidator {
    config: ValidationConfig,
}

impl RateValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate against the current clock.
    pub fn validate(&self, rate: &Rate) -> Result<(), RateError> {
        self.validate_at(rate, time::now_millis())
    }

    /// Validate against an explicit clock reading.
    pub fn validate_at(&self, rate: &Rate, now_ms: i64) -> Result<(), RateError> {
        if !symbol::is_valid_symbol(&rate.symbol) {
            return Err(RateError::InvalidSymbol(rate.symbol.clone()));
        }
        if rate.provider_name.as_deref().map_or(true, str::is_empty) {
            return Err(RateError::MissingProvider {
                symbol: rate.symbol.clone(),
            });
        }

        let bid = Self::side(rate, rate.bid, "bid")?;
        let ask = Self::side(rate, rate.ask, "ask")?;

        if !self.config.enabled {
            return Ok(());
        }

        if bid > ask {
            return Err(RateError::BidAboveAsk {
                symbol: rate.symbol.clone(),
                bid: bid.to_string(),
                ask: ask.to_string(),
            });
        }

        let spread = (ask - bid) / bid;
        if spread > self.config.max_spread_ratio {
            return Err(RateError::SpreadTooWide {
                symbol: rate.symbol.clone(),
                spread: spread.round_dp(6).to_string(),
                max: self.config.max_spread_ratio.to_string(),
            });
        }

        let ahead = rate.timestamp.saturating_sub(now_ms);
        if ahead > self.config.future_tolerance_ms {
            return Err(RateError::InFuture {
                symbol: rate.symbol.clone(),
                ahead_ms: ahead,
            });
        }

        let age = now_ms.saturating_sub(rate.timestamp);
        if age > self.config.max_age_ms {
            return Err(RateError::TooOld {
                symbol: rate.symbol.clone(),
                age_ms: age,
                max_age_ms: self.config.max_age_ms,
            });
        }

        Ok(())
    }

    fn side(rate: &Rate, value: Option<Decimal>, side: &'static str) -> Result<Decimal, RateError> {
        let value = value.ok_or_else(|| RateError::MissingPrice {
            symbol: rate.symbol.clone(),
            side,
        })?;
        if value <= Decimal::ZERO {
            return Err(RateError::NonPositivePrice {
                symbol: rate.symbol.clone(),
                side,
                value: value.to_string(),
            });
        }
        Ok(value)
    }
}
