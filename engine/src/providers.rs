//! Expected-provider registry keyed by base symbol.

use dashmap::DashMap;
use fxrelay_common::symbol;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Expected providers for one base symbol, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolConfig {
    pub base_symbol: String,
    pub expected_providers: Vec<String>,
}

/// Concurrent map from base symbol to the providers whose quotes complete a window.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct SymbolProviders {
    inner: Arc<DashMap<String, Vec<String>>>,
}

impl SymbolProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration entries.
    pub fn from_configs(configs: &[SymbolConfig]) -> Self {
        let providers = Self::new();
        providers.replace_all(configs);
        providers
    }

    /// Set the provider list for a symbol. Duplicates are dropped, order kept.
    pub fn set(&self, base_symbol: &str, providers: Vec<String>) {
        let mut unique: Vec<String> = Vec::with_capacity(providers.len());
        for p in providers {
            if !p.is_empty() && !unique.contains(&p) {
                unique.push(p);
            }
        }
        self.inner.insert(symbol::normalize(base_symbol), unique);
    }

    /// Replace the whole registry.
    ///
    /// Entries are written before stale keys are dropped, so concurrent readers
    /// never see a configured symbol vanish mid-update.
    pub fn replace_all(&self, configs: &[SymbolConfig]) {
        let keep: Vec<String> = configs
            .iter()
            .map(|c| symbol::normalize(&c.base_symbol))
            .collect();
        for config in configs {
            self.set(&config.base_symbol, config.expected_providers.clone());
        }
        self.inner.retain(|k, _| keep.contains(k));
        info!(symbols = self.inner.len(), "Expected providers loaded");
    }

    /// Providers expected for a symbol, in configured order.
    pub fn get(&self, symbol: &str) -> Option<Vec<String>> {
        self.inner
            .get(&symbol::normalize(symbol))
            .map(|v| v.value().clone())
    }

    /// Configured base symbols.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(symbol: &str, providers: &[&str]) -> SymbolConfig {
        SymbolConfig {
            base_symbol: symbol.to_string(),
            expected_providers: providers.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_lookup_normalizes() {
        let providers = SymbolProviders::from_configs(&[make_config("USD/TRY", &["PF1", "PF2"])]);
        assert_eq!(
            providers.get("PF1_USDTRY"),
            Some(vec!["PF1".to_string(), "PF2".to_string()])
        );
        assert!(providers.get("EURUSD").is_none());
    }

    #[test]
    fn test_duplicates_dropped() {
        let providers = SymbolProviders::new();
        providers.set("USDTRY", vec!["PF1".into(), "PF1".into(), "PF2".into()]);
        assert_eq!(providers.get("USDTRY").map(|v| v.len()), Some(2));
    }

    #[test]
    fn test_replace_all_removes_stale_symbols() {
        let providers = SymbolProviders::from_configs(&[
            make_config("USDTRY", &["PF1"]),
            make_config("EURUSD", &["PF1"]),
        ]);
        let shared = providers.clone();
        providers.replace_all(&[make_config("GBPUSD", &["PF2"])]);

        assert_eq!(shared.symbols(), vec!["GBPUSD".to_string()]);
    }
}
