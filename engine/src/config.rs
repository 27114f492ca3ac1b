//! Rule configuration file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::EngineResult;
use crate::providers::{SymbolConfig, SymbolProviders};
use crate::rules::{CalculationRule, RuleEngine};

/// Expected providers per symbol plus the calculation rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    #[serde(default)]
    pub symbol_configs: Vec<SymbolConfig>,
    #[serde(default)]
    pub calculation_rules: Vec<CalculationRule>,
}

impl RuleConfig {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            symbols = config.symbol_configs.len(),
            rules = config.calculation_rules.len(),
            "Rule configuration read"
        );
        Ok(config)
    }

    /// Install the rules, then the provider map.
    ///
    /// A rule set that fails validation leaves both untouched.
    pub fn apply(&self, rules: &RuleEngine, providers: &SymbolProviders) -> EngineResult<()> {
        rules.load_rules(self.calculation_rules.clone())?;
        providers.replace_all(&self.symbol_configs);
        Ok(())
    }
}
