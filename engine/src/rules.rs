//! Calculation rules and the rule/dependency engine.
//!
//! The active [`RuleSet`] is immutable and replaced as a unit: readers clone
//! the `Arc` and never observe a half-built trigger map.

use fxrelay_common::{symbol, Rate};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::strategy::{AverageStrategy, CalculationStrategy, FormulaStrategy};

/// Kind of derivation a rule performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleType {
    #[serde(rename = "AVG")]
    Avg,
    #[serde(rename = "CROSS")]
    Cross,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Avg => f.write_str("AVG"),
            RuleType::Cross => f.write_str("CROSS"),
        }
    }
}

/// A declarative derivation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationRule {
    pub output_symbol: String,
    pub rule_type: RuleType,
    /// Base symbols whose raw quotes feed the rule.
    #[serde(default)]
    pub raw_sources: Vec<String>,
    /// Calculated symbols the rule consumes.
    #[serde(default)]
    pub required_calculated_rates: Vec<String>,
    /// Formula path for CROSS rules.
    #[serde(default)]
    pub implementation: Option<String>,
    /// Strategy id overriding the rule type's default.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
}

impl CalculationRule {
    pub fn new(output_symbol: impl Into<String>, rule_type: RuleType) -> Self {
        Self {
            output_symbol: output_symbol.into(),
            rule_type,
            raw_sources: Vec::new(),
            required_calculated_rates: Vec::new(),
            implementation: None,
            strategy: None,
            parameters: BTreeMap::new(),
            priority: 0,
            description: None,
        }
    }

    pub fn with_raw_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required<I, S>(mut self, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_calculated_rates = required.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_implementation(mut self, path: impl Into<String>) -> Self {
        self.implementation = Some(path.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Key identifying the rule's output in the trigger map.
    pub fn output_key(&self) -> String {
        derived_key(&self.output_symbol)
    }
}

fn derived_key(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Immutable, validated rule collection with its trigger map.
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Sorted by priority; ties keep load order.
    rules: Vec<CalculationRule>,
    /// Input symbol to indices of consuming rules.
    triggers: HashMap<String, BTreeSet<usize>>,
    /// Output key to rule index.
    outputs: HashMap<String, usize>,
}

impl RuleSet {
    /// Validate and index `rules`.
    pub fn build(mut rules: Vec<CalculationRule>) -> EngineResult<Self> {
        rules.sort_by_key(|r| r.priority);

        let mut outputs: HashMap<String, usize> = HashMap::with_capacity(rules.len());
        for (idx, rule) in rules.iter().enumerate() {
            Self::validate_shape(rule)?;
            if outputs.insert(rule.output_key(), idx).is_some() {
                return Err(EngineError::RuleConfig(format!(
                    "duplicate output symbol {}",
                    rule.output_symbol
                )));
            }
        }

        for (idx, rule) in rules.iter().enumerate() {
            for dep in &rule.required_calculated_rates {
                match outputs.get(&derived_key(dep)) {
                    Some(&producer) if producer < idx => {}
                    Some(_) => {
                        return Err(EngineError::RuleConfig(format!(
                            "{} depends on {} which does not run earlier",
                            rule.output_symbol, dep
                        )))
                    }
                    None => {
                        return Err(EngineError::RuleConfig(format!(
                            "{} depends on {} which no rule produces",
                            rule.output_symbol, dep
                        )))
                    }
                }
            }
        }

        let mut triggers: HashMap<String, BTreeSet<usize>> = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            for source in &rule.raw_sources {
                triggers.entry(symbol::normalize(source)).or_default().insert(idx);
            }
            for dep in &rule.required_calculated_rates {
                triggers.entry(derived_key(dep)).or_default().insert(idx);
            }
        }

        Ok(Self {
            rules,
            triggers,
            outputs,
        })
    }

    fn validate_shape(rule: &CalculationRule) -> EngineResult<()> {
        let fail = |msg: &str| {
            Err(EngineError::RuleConfig(format!(
                "rule {:?}: {}",
                rule.output_symbol, msg
            )))
        };
        if rule.output_symbol.trim().is_empty() {
            return fail("empty output symbol");
        }
        match rule.rule_type {
            RuleType::Avg if rule.raw_sources.is_empty() => fail("AVG rule without raw sources"),
            RuleType::Cross if rule.required_calculated_rates.is_empty() => {
                fail("CROSS rule without required calculated rates")
            }
            RuleType::Cross
                if rule.strategy.is_none()
                    && rule.implementation.as_deref().map_or(true, |p| p.trim().is_empty()) =>
            {
                fail("CROSS rule without implementation")
            }
            _ => Ok(()),
        }
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[CalculationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule producing `output_symbol`.
    pub fn rule_for_output(&self, output_symbol: &str) -> Option<&CalculationRule> {
        self.outputs
            .get(&derived_key(output_symbol))
            .map(|&idx| &self.rules[idx])
    }

    fn direct_indices(&self, symbol: &str) -> BTreeSet<usize> {
        let mut found = BTreeSet::new();
        for key in [symbol::normalize(symbol), derived_key(symbol)] {
            if let Some(set) = self.triggers.get(&key) {
                found.extend(set.iter().copied());
            }
        }
        found
    }

    /// Every rule reachable from `symbol` through the trigger map, in priority order.
    pub fn affected_by(&self, symbol: &str) -> Vec<&CalculationRule> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.direct_indices(symbol).into_iter().collect();

        while let Some(idx) = queue.pop_front() {
            if !seen.insert(idx) {
                continue;
            }
            let output = self.rules[idx].output_key();
            if let Some(next) = self.triggers.get(&output) {
                queue.extend(next.iter().copied().filter(|i| !seen.contains(i)));
            }
        }

        seen.into_iter().map(|idx| &self.rules[idx]).collect()
    }

    /// AVG rules listing `symbol` among their raw sources.
    pub fn avg_rules_for(&self, symbol: &str) -> Vec<&CalculationRule> {
        let base = symbol::normalize(symbol);
        self.triggers
            .get(&base)
            .into_iter()
            .flatten()
            .map(|&idx| &self.rules[idx])
            .filter(|r| r.rule_type == RuleType::Avg)
            .collect()
    }

    pub fn of_type(&self, rule_type: RuleType) -> Vec<&CalculationRule> {
        self.rules.iter().filter(|r| r.rule_type == rule_type).collect()
    }
}

/// Strategies keyed by rule type, plus any registered under their own id.
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    by_type: HashMap<RuleType, Arc<dyn CalculationStrategy>>,
    by_id: HashMap<String, Arc<dyn CalculationStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Averaging for AVG and the formula strategy for CROSS.
    pub fn with_defaults(average: AverageStrategy, formula: Arc<FormulaStrategy>) -> Self {
        let mut registry = Self::new();
        registry.register(RuleType::Avg, Arc::new(average));
        registry.register(RuleType::Cross, formula);
        registry
    }

    /// Make `strategy` the default for `rule_type`.
    pub fn register(&mut self, rule_type: RuleType, strategy: Arc<dyn CalculationStrategy>) {
        self.by_id.insert(strategy.id().to_string(), Arc::clone(&strategy));
        self.by_type.insert(rule_type, strategy);
    }

    /// Make `strategy` selectable through a rule's `strategy` field.
    pub fn register_named(&mut self, strategy: Arc<dyn CalculationStrategy>) {
        self.by_id.insert(strategy.id().to_string(), strategy);
    }

    pub fn resolve(&self, rule: &CalculationRule) -> Option<Arc<dyn CalculationStrategy>> {
        match &rule.strategy {
            Some(id) => self.by_id.get(id).cloned(),
            None => self.by_type.get(&rule.rule_type).cloned(),
        }
    }
}

/// Holds the active rule set and dispatches rules to strategies.
pub struct RuleEngine {
    active: RwLock<Arc<RuleSet>>,
    strategies: RwLock<StrategyRegistry>,
}

impl RuleEngine {
    pub fn new(strategies: StrategyRegistry) -> Self {
        Self {
            active: RwLock::new(Arc::new(RuleSet::default())),
            strategies: RwLock::new(strategies),
        }
    }

    /// Validate and atomically replace the active rules.
    ///
    /// On error the previous set stays active.
    pub fn load_rules(&self, rules: Vec<CalculationRule>) -> EngineResult<()> {
        let set = RuleSet::build(rules)?;
        info!(
            rules = set.len(),
            trigger_symbols = set.triggers.len(),
            "Rule set loaded"
        );
        *self.active.write() = Arc::new(set);
        Ok(())
    }

    /// Current rule set.
    pub fn rule_set(&self) -> Arc<RuleSet> {
        self.active.read().clone()
    }

    /// Rules `symbol` affects, directly or through derived outputs, by priority.
    pub fn rules_affected_by(&self, symbol: &str) -> Vec<CalculationRule> {
        self.rule_set()
            .affected_by(symbol)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn rules_of_type(&self, rule_type: RuleType) -> Vec<CalculationRule> {
        self.rule_set().of_type(rule_type).into_iter().cloned().collect()
    }

    pub fn register_strategy(&self, rule_type: RuleType, strategy: Arc<dyn CalculationStrategy>) {
        self.strategies.write().register(rule_type, strategy);
    }

    pub fn register_named_strategy(&self, strategy: Arc<dyn CalculationStrategy>) {
        self.strategies.write().register_named(strategy);
    }

    pub fn has_strategy(&self, rule: &CalculationRule) -> bool {
        self.strategies.read().resolve(rule).is_some()
    }

    /// Run the rule's strategy, reporting why it failed.
    pub fn evaluate(&self, rule: &CalculationRule, inputs: &HashMap<String, Rate>) -> EngineResult<Rate> {
        let strategy = self
            .strategies
            .read()
            .resolve(rule)
            .ok_or_else(|| EngineError::StrategyNotFound {
                output_symbol: rule.output_symbol.clone(),
                rule_type: rule.rule_type.to_string(),
            })?;

        panic::catch_unwind(AssertUnwindSafe(|| strategy.calculate(rule, inputs)))
            .unwrap_or_else(|_| Err(EngineError::StrategyPanic(rule.output_symbol.clone())))
    }

    /// Run the rule's strategy. Failures are logged and yield `None`.
    #[instrument(skip(self, rule, inputs), fields(output = %rule.output_symbol, rule_type = %rule.rule_type))]
    pub fn execute(&self, rule: &CalculationRule, inputs: &HashMap<String, Rate>) -> Option<Rate> {
        match self.evaluate(rule, inputs) {
            Ok(rate) => {
                debug!(bid = ?rate.bid, ask = ?rate.ask, "Rule calculated");
                Some(rate)
            }
            Err(e) if e.is_incomplete_input() => {
                debug!(error = %e, "Rule inputs incomplete");
                None
            }
            Err(e) => {
                warn!(error = %e, "Rule calculation failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{DEFAULT_AVERAGE_SCALE, FORMULA_STRATEGY_ID};
    use rust_decimal_macros::dec;

    fn usd_try_avg() -> CalculationRule {
        CalculationRule::new("USDTRY_AVG", RuleType::Avg)
            .with_raw_sources(["USDTRY"])
            .with_priority(1)
    }

    fn eur_usd_avg() -> CalculationRule {
        CalculationRule::new("EURUSD_AVG", RuleType::Avg)
            .with_raw_sources(["EUR/USD"])
            .with_priority(1)
    }

    fn eur_try_cross() -> CalculationRule {
        CalculationRule::new("EURTRY", RuleType::Cross)
            .with_required(["USDTRY_AVG", "EURUSD_AVG"])
            .with_implementation("eur_try.fx")
            .with_priority(10)
    }

    fn eur_try_double() -> CalculationRule {
        CalculationRule::new("EURTRY_X2", RuleType::Cross)
            .with_required(["EURTRY"])
            .with_implementation("double.fx")
            .with_priority(20)
    }

    fn make_engine() -> (RuleEngine, Arc<FormulaStrategy>) {
        let formula = Arc::new(FormulaStrategy::new("scripts"));
        let registry = StrategyRegistry::with_defaults(
            AverageStrategy::new(DEFAULT_AVERAGE_SCALE),
            Arc::clone(&formula),
        );
        (RuleEngine::new(registry), formula)
    }

    #[test]
    fn test_rules_sorted_by_priority() {
        let (engine, _) = make_engine();
        engine
            .load_rules(vec![eur_try_double(), eur_try_cross(), usd_try_avg(), eur_usd_avg()])
            .unwrap();

        let outputs: Vec<String> = engine
            .rule_set()
            .rules()
            .iter()
            .map(|r| r.output_symbol.clone())
            .collect();
        assert_eq!(outputs, vec!["USDTRY_AVG", "EURUSD_AVG", "EURTRY", "EURTRY_X2"]);
    }

    #[test]
    fn test_affected_rules_are_transitive() {
        let (engine, _) = make_engine();
        engine
            .load_rules(vec![usd_try_avg(), eur_usd_avg(), eur_try_cross(), eur_try_double()])
            .unwrap();

        let affected: Vec<String> = engine
            .rules_affected_by("PF1_USDTRY")
            .into_iter()
            .map(|r| r.output_symbol)
            .collect();
        assert_eq!(affected, vec!["USDTRY_AVG", "EURTRY", "EURTRY_X2"]);

        let affected = engine.rules_affected_by("eurtry");
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].output_symbol, "EURTRY_X2");

        assert!(engine.rules_affected_by("GBPUSD").is_empty());
    }

    #[test]
    fn test_avg_rules_for_raw_symbol() {
        let (engine, _) = make_engine();
        engine.load_rules(vec![usd_try_avg(), eur_usd_avg(), eur_try_cross()]).unwrap();
        let set = engine.rule_set();

        let avg = set.avg_rules_for("USD/TRY");
        assert_eq!(avg.len(), 1);
        assert_eq!(avg[0].output_symbol, "USDTRY_AVG");
        assert_eq!(set.of_type(RuleType::Cross).len(), 1);
        assert!(set.rule_for_output("eurtry").is_some());
    }

    #[test]
    fn test_duplicate_outputs_rejected_and_old_set_kept() {
        let (engine, _) = make_engine();
        engine.load_rules(vec![usd_try_avg()]).unwrap();

        let duplicate = usd_try_avg().with_priority(5);
        let err = engine.load_rules(vec![usd_try_avg(), duplicate]).unwrap_err();
        assert!(matches!(err, EngineError::RuleConfig(_)));
        assert_eq!(engine.rule_set().len(), 1);
    }

    #[test]
    fn test_dependency_validation() {
        let (engine, _) = make_engine();

        let err = engine.load_rules(vec![eur_try_cross()]).unwrap_err();
        assert!(err.to_string().contains("no rule produces"));

        let late_avg = usd_try_avg().with_priority(50);
        let err = engine
            .load_rules(vec![late_avg, eur_usd_avg(), eur_try_cross()])
            .unwrap_err();
        assert!(err.to_string().contains("does not run earlier"));

        let a = CalculationRule::new("AAABBB", RuleType::Cross)
            .with_required(["CCCDDD"])
            .with_implementation("a.fx");
        let b = CalculationRule::new("CCCDDD", RuleType::Cross)
            .with_required(["AAABBB"])
            .with_implementation("b.fx");
        assert!(engine.load_rules(vec![a, b]).is_err());
    }

    #[test]
    fn test_shape_validation() {
        let (engine, _) = make_engine();
        assert!(engine
            .load_rules(vec![CalculationRule::new("USDTRY_AVG", RuleType::Avg)])
            .is_err());
        assert!(engine
            .load_rules(vec![CalculationRule::new(" ", RuleType::Avg).with_raw_sources(["USDTRY"])])
            .is_err());
        let mut no_impl = eur_try_cross();
        no_impl.implementation = None;
        assert!(engine
            .load_rules(vec![usd_try_avg(), eur_usd_avg(), no_impl])
            .is_err());
    }

    #[test]
    fn test_execute_dispatches_by_type() {
        let (engine, formula) = make_engine();
        formula
            .register_source(
                "eur_try.fx",
                "u = rate('USDTRY_AVG'); e = rate('EURUSD_AVG'); bid = e.bid * u.mid; ask = e.ask * u.mid",
            )
            .unwrap();
        engine.load_rules(vec![usd_try_avg(), eur_usd_avg(), eur_try_cross()]).unwrap();

        let mut raw = HashMap::new();
        raw.insert("PF1".to_string(), Rate::raw("PF1", "PF1_USDTRY", dec!(34.10), dec!(34.12), 1));
        let avg = engine.execute(&usd_try_avg(), &raw).unwrap();
        assert_eq!(avg.bid, Some(dec!(34.10)));

        let mut derived = HashMap::new();
        derived.insert("USDTRY_AVG".to_string(), avg);
        assert!(engine.execute(&eur_try_cross(), &derived).is_none());

        derived.insert(
            "EURUSD_AVG".to_string(),
            Rate::derived("EURUSD_AVG", fxrelay_common::RateType::Average, dec!(1.08), dec!(1.082), 1, "AVERAGE"),
        );
        let cross = engine.execute(&eur_try_cross(), &derived).unwrap();
        assert_eq!(cross.bid, Some(dec!(36.8388)));
        assert!(cross
            .calculated_by_strategy
            .unwrap_or_default()
            .starts_with(FORMULA_STRATEGY_ID));
    }

    struct PanickingStrategy;

    impl CalculationStrategy for PanickingStrategy {
        fn id(&self) -> &str {
            "PANIC"
        }

        fn calculate(&self, _: &CalculationRule, _: &HashMap<String, Rate>) -> EngineResult<Rate> {
            panic!("strategy bug")
        }
    }

    #[test]
    fn test_missing_and_panicking_strategies_yield_none() {
        let engine = RuleEngine::new(StrategyRegistry::new());
        assert!(!engine.has_strategy(&usd_try_avg()));
        assert!(matches!(
            engine.evaluate(&usd_try_avg(), &HashMap::new()),
            Err(EngineError::StrategyNotFound { .. })
        ));

        engine.register_named_strategy(Arc::new(PanickingStrategy));
        let mut rule = usd_try_avg();
        rule.strategy = Some("PANIC".into());
        assert!(matches!(
            engine.evaluate(&rule, &HashMap::new()),
            Err(EngineError::StrategyPanic(_))
        ));
        assert!(engine.execute(&rule, &HashMap::new()).is_none());
    }

    #[test]
    fn test_rule_json_shape() {
        let rule: CalculationRule = serde_json::from_str(
            r#"{
                "outputSymbol": "EURTRY",
                "ruleType": "CROSS",
                "requiredCalculatedRates": ["USDTRY_AVG", "EURUSD_AVG"],
                "implementation": "eur_try.fx",
                "parameters": {"defaultScale": "5"},
                "priority": 10
            }"#,
        )
        .unwrap();
        assert_eq!(rule.rule_type, RuleType::Cross);
        assert!(rule.raw_sources.is_empty());
        assert_eq!(rule.parameters["defaultScale"], "5");
    }
}
