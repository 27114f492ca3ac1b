//! Calculation strategies.
//!
//! A strategy is a pure function of a rule and its input rates. It never
//! mutates its inputs and performs no I/O beyond loading its own formula.

mod average;
mod formula;

pub use average::{AverageStrategy, AVERAGE_STRATEGY_ID, DEFAULT_AVERAGE_SCALE};
pub use formula::{FormulaStrategy, FORMULA_STRATEGY_ID};

use fxrelay_common::Rate;
use std::collections::HashMap;

use crate::error::EngineResult;
use crate::rules::CalculationRule;

/// One rule type's calculation.
pub trait CalculationStrategy: Send + Sync {
    /// Identifier recorded in `calculated_by_strategy`.
    fn id(&self) -> &str;

    /// Derive the rule's output from `inputs`.
    fn calculate(&self, rule: &CalculationRule, inputs: &HashMap<String, Rate>) -> EngineResult<Rate>;
}
