//! Engine error types.

use fxrelay_common::RateError;
use thiserror::Error;

use crate::script::FormulaError;

/// Errors that can occur in the aggregation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Incoming rate failed validation.
    #[error("Invalid rate: {0}")]
    InvalidRate(#[from] RateError),

    /// Cache backend failure.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Publish backend failure.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Rule set rejected at load time.
    #[error("Invalid rule configuration: {0}")]
    RuleConfig(String),

    /// No strategy registered for a rule.
    #[error("No strategy for rule {output_symbol} ({rule_type})")]
    StrategyNotFound {
        output_symbol: String,
        rule_type: String,
    },

    /// None of the inputs carried both sides.
    #[error("No valid inputs for {0}")]
    NoValidInputs(String),

    /// A required input is absent.
    #[error("Missing input {input} for {output_symbol}")]
    MissingInput {
        output_symbol: String,
        input: String,
    },

    /// Pipeline invoked without a triggering rate.
    #[error("No triggering rate")]
    MissingTrigger,

    /// Formula failed to load, parse or evaluate.
    #[error("Formula error in {output_symbol}: {source}")]
    Formula {
        output_symbol: String,
        #[source]
        source: FormulaError,
    },

    /// Strategy panicked during evaluation.
    #[error("Strategy panicked while calculating {0}")]
    StrategyPanic(String),

    /// Window could not be handed to a worker.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Filesystem failure reading configuration or scripts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the error means "not ready yet" rather than a failure.
    pub fn is_incomplete_input(&self) -> bool {
        matches!(
            self,
            EngineError::NoValidInputs(_) | EngineError::MissingInput { .. }
        )
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
