use dashmap::DashMap;
use fxrelay_common::{symbol, time, InputRateInfo, Rate, RateType};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::CalculationStrategy;
use crate::error::{EngineError, EngineResult};
use crate::rules::CalculationRule;
use crate::script::{Bindings, Evaluation, FormulaError, Script, Value};

pub const FORMULA_STRATEGY_ID: &str = "FORMULA";

/// Cross-rate strategy evaluating the formula named by a rule's
/// `implementation`.
///
/// Formulas are read relative to `script_root` and parsed once per path.
pub struct FormulaStrategy {
    script_root: PathBuf,
    scripts: DashMap<String, Arc<Script>>,
}

impl FormulaStrategy {
    pub fn new(script_root: impl Into<PathBuf>) -> Self {
        Self {
            script_root: script_root.into(),
            scripts: DashMap::new(),
        }
    }

    /// Register formula source under `path` without touching the filesystem.
    pub fn register_source(&self, path: &str, source: &str) -> Result<(), FormulaError> {
        let script = Script::parse(source)?;
        self.scripts.insert(path.to_string(), Arc::new(script));
        Ok(())
    }

    /// Number of parsed formulas held.
    pub fn cached_scripts(&self) -> usize {
        self.scripts.len()
    }

    fn load(&self, path: &str) -> Result<Arc<Script>, FormulaError> {
        if let Some(script) = self.scripts.get(path) {
            return Ok(Arc::clone(script.value()));
        }

        let full_path = self.script_root.join(path);
        let source = std::fs::read_to_string(&full_path).map_err(|e| FormulaError::Read {
            path: full_path.display().to_string(),
            message: e.to_string(),
        })?;
        let script = Arc::new(Script::parse(&source)?);
        debug!(path, "Formula loaded");

        // A concurrent loader may have won; keep whichever landed first.
        Ok(Arc::clone(
            self.scripts.entry(path.to_string()).or_insert(script).value(),
        ))
    }

    /// Index every input under each spelling a formula may use.
    ///
    /// Keys given by the caller always win over generated variants.
    pub fn adapt_inputs(inputs: &HashMap<String, Rate>) -> HashMap<String, Rate> {
        let mut keys: Vec<&String> = inputs.keys().collect();
        keys.sort();

        let mut adapted: HashMap<String, Rate> = inputs.clone();
        for key in keys {
            let rate = &inputs[key];
            let variants = symbol::derived_variants(key)
                .into_iter()
                .chain(symbol::derived_variants(&rate.symbol))
                .chain([
                    key.to_uppercase(),
                    symbol::without_slash(&key.to_uppercase()),
                    rate.symbol.to_uppercase(),
                ]);
            for variant in variants {
                adapted.entry(variant).or_insert_with(|| rate.clone());
            }
        }
        adapted
    }

    fn bindings<'a>(rule: &CalculationRule, rates: &'a HashMap<String, Rate>) -> Bindings<'a> {
        let mut variables = HashMap::new();
        for (name, raw) in &rule.parameters {
            let value = match Decimal::from_str(raw.trim()) {
                Ok(n) => Value::Number(n),
                Err(_) => Value::Text(raw.clone()),
            };
            variables.insert(name.clone(), value);
        }
        variables.insert("outputSymbol".to_string(), Value::Text(rule.output_symbol.clone()));

        Bindings {
            variables,
            rates,
            now_ms: time::now_millis(),
        }
    }

    fn numeric(eval: &Evaluation, name: &'static str) -> Result<Decimal, FormulaError> {
        eval.get(name)
            .ok_or(FormulaError::MissingResult(name))?
            .as_number()
            .ok_or(FormulaError::NonNumericResult(name))
    }

    fn build_rate(
        &self,
        rule: &CalculationRule,
        path: &str,
        eval: Evaluation,
        rates: &HashMap<String, Rate>,
    ) -> Result<Rate, FormulaError> {
        let bid = Self::numeric(&eval, "bid")?;
        let ask = Self::numeric(&eval, "ask")?;
        if bid > ask {
            return Err(FormulaError::InvertedResult {
                bid: bid.to_string(),
                ask: ask.to_string(),
            });
        }

        let timestamp = match eval.get("timestamp") {
            None => time::now_millis(),
            Some(value) => value
                .as_number()
                .and_then(|n| n.trunc().to_i64())
                .ok_or(FormulaError::NonNumericResult("timestamp"))?,
        };

        let inputs: Vec<InputRateInfo> = eval
            .rates_read
            .iter()
            .filter_map(|key| rates.get(key).or_else(|| rates.get(&key.to_uppercase())))
            .map(InputRateInfo::from)
            .collect();

        let strategy = format!("{}:{}", self.id(), path);
        Ok(
            Rate::derived(&rule.output_symbol, RateType::Cross, bid, ask, timestamp, strategy)
                .with_inputs(inputs),
        )
    }

    fn run(&self, rule: &CalculationRule, inputs: &HashMap<String, Rate>) -> Result<Rate, FormulaError> {
        let path = rule
            .implementation
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(FormulaError::NoImplementation)?;
        let script = self.load(path)?;

        let rates = Self::adapt_inputs(inputs);
        let eval = script.evaluate(Self::bindings(rule, &rates))?;
        self.build_rate(rule, path, eval, &rates)
    }
}

impl CalculationStrategy for FormulaStrategy {
    fn id(&self) -> &str {
        FORMULA_STRATEGY_ID
    }

    fn calculate(&self, rule: &CalculationRule, inputs: &HashMap<String, Rate>) -> EngineResult<Rate> {
        self.run(rule, inputs).map_err(|source| EngineError::Formula {
            output_symbol: rule.output_symbol.clone(),
            source,
        })
    }
}
