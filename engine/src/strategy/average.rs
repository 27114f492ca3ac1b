use fxrelay_common::{time, InputRateInfo, Rate, RateType};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;

use super::CalculationStrategy;
use crate::error::{EngineError, EngineResult};
use crate::rules::CalculationRule;

pub const AVERAGE_STRATEGY_ID: &str = "AVERAGE";

/// Fractional digits kept on averaged bid/ask.
pub const DEFAULT_AVERAGE_SCALE: u32 = 6;

/// Arithmetic mean of bid and ask across every two-sided input.
#[derive(Debug, Clone)]
pub struct AverageStrategy {
    scale: u32,
}

impl AverageStrategy {
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }

    fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.scale, RoundingStrategy::MidpointAwayFromZero)
    }
}

impl Default for AverageStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_AVERAGE_SCALE)
    }
}

impl CalculationStrategy for AverageStrategy {
    fn id(&self) -> &str {
        AVERAGE_STRATEGY_ID
    }

    fn calculate(&self, rule: &CalculationRule, inputs: &HashMap<String, Rate>) -> EngineResult<Rate> {
        // Sorted so the recorded inputs do not depend on map order.
        let mut valid: Vec<(&String, &Rate)> = inputs.iter().filter(|(_, r)| r.is_two_sided()).collect();
        valid.sort_by(|a, b| a.0.cmp(b.0));

        let mut bid_sum = Decimal::ZERO;
        let mut ask_sum = Decimal::ZERO;
        let mut latest: Option<i64> = None;
        for (_, rate) in &valid {
            if let (Some(bid), Some(ask)) = (rate.bid, rate.ask) {
                bid_sum += bid;
                ask_sum += ask;
                latest = Some(latest.map_or(rate.timestamp, |t| t.max(rate.timestamp)));
            }
        }

        if valid.is_empty() {
            return Err(EngineError::NoValidInputs(rule.output_symbol.clone()));
        }

        let count = Decimal::from(valid.len() as u64);
        let bid = self.round(bid_sum / count);
        let ask = self.round(ask_sum / count);
        let timestamp = latest.unwrap_or_else(time::now_millis);

        let inputs = valid.iter().map(|(_, r)| InputRateInfo::from(*r)).collect();
        Ok(
            Rate::derived(&rule.output_symbol, RateType::Average, bid, ask, timestamp, self.id())
                .with_inputs(inputs),
        )
    }
}
