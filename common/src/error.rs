//! Error types shared by FxRelay crates.

use thiserror::Error;

/// Errors describing an unusable rate or symbol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    /// Symbol is empty or cannot be normalized to a currency pair.
    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Raw rate arrived without a provider name.
    #[error("Missing provider for {symbol}")]
    MissingProvider { symbol: String },

    /// Bid or ask is absent.
    #[error("Missing {side} for {symbol}")]
    MissingPrice { symbol: String, side: &'static str },

    /// Bid or ask is zero or negative.
    #[error("Non-positive {side} {value} for {symbol}")]
    NonPositivePrice {
        symbol: String,
        side: &'static str,
        value: String,
    },

    /// Bid is above ask.
    #[error("Bid {bid} above ask {ask} for {symbol}")]
    BidAboveAsk {
        symbol: String,
        bid: String,
        ask: String,
    },

    /// Spread ratio exceeds the configured maximum.
    #[error("Spread {spread} exceeds maximum {max} for {symbol}")]
    SpreadTooWide {
        symbol: String,
        spread: String,
        max: String,
    },

    /// Rate timestamp is older than the configured maximum age.
    #[error("Rate for {symbol} is {age_ms}ms old, max {max_age_ms}ms")]
    TooOld {
        symbol: String,
        age_ms: i64,
        max_age_ms: i64,
    },

    /// Rate timestamp lies too far in the future.
    #[error("Rate for {symbol} is {ahead_ms}ms in the future")]
    InFuture { symbol: String, ahead_ms: i64 },
}

impl RateError {
    /// Short machine-readable code for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            RateError::InvalidSymbol(_) => "INVALID_SYMBOL",
            RateError::MissingProvider { .. } => "MISSING_PROVIDER",
            RateError::MissingPrice { .. } => "MISSING_PRICE",
            RateError::NonPositivePrice { .. } => "NON_POSITIVE_PRICE",
            RateError::BidAboveAsk { .. } => "BID_ABOVE_ASK",
            RateError::SpreadTooWide { .. } => "SPREAD_TOO_WIDE",
            RateError::TooOld { .. } => "TOO_OLD",
            RateError::InFuture { .. } => "IN_FUTURE",
        }
    }
}
