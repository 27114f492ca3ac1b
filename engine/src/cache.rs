//! Rate cache contract and an in-memory implementation with TTL support.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use fxrelay_common::{symbol, Rate};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Key/value store consulted and fed by the pipeline stages.
///
/// Storage medium and expiry policy belong to the implementation.
#[async_trait]
pub trait RateCache: Send + Sync {
    /// Store a raw rate under its (base symbol, provider) pair.
    async fn cache_raw_rate(&self, rate: &Rate) -> EngineResult<()>;

    /// Store a calculated rate under its exact symbol.
    async fn cache_calculated_rate(&self, rate: &Rate) -> EngineResult<()>;

    /// Look up a calculated rate by symbol.
    async fn get_calculated_rate(&self, symbol: &str) -> EngineResult<Option<Rate>>;

    /// Latest raw rate per provider for a base symbol, restricted to `providers`.
    async fn get_raw_rates_for_symbol(
        &self,
        symbol: &str,
        providers: &[String],
    ) -> EngineResult<HashMap<String, Rate>>;
}

/// Cached rate entry.
#[derive(Debug, Clone)]
struct CacheEntry {
    rate: Rate,
    cached_at: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn new(rate: Rate, ttl: Duration) -> Self {
        Self {
            rate,
            cached_at: Utc::now(),
            ttl,
        }
    }

    fn is_valid(&self) -> bool {
        Utc::now().signed_duration_since(self.cached_at) < self.ttl
    }
}

/// Configuration for the in-memory cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time to live for every entry.
    pub ttl: Duration,
    /// Maximum number of entries before eviction.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(5),
            max_entries: 10_000,
        }
    }
}

/// Thread-safe rate cache with TTL and capacity eviction.
pub struct InMemoryRateCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
}

impl InMemoryRateCache {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    fn raw_key(base_symbol: &str, provider: &str) -> String {
        format!("raw:{}:{}", base_symbol, provider)
    }

    fn calculated_key(symbol: &str) -> String {
        format!("calc:{}", symbol.trim().to_uppercase())
    }

    fn get(&self, key: &str) -> Option<Rate> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_valid() {
                return Some(entry.rate.clone());
            }
            drop(entry);
            self.remove_expired(key);
        }
        None
    }

    /// Drop `key` only if its current entry is expired. A writer may have
    /// refreshed it since the caller looked.
    fn remove_expired(&self, key: &str) -> bool {
        let removed = self.entries.remove_if(key, |_, entry| !entry.is_valid()).is_some();
        if removed {
            debug!(key, "Cache entry expired");
        }
        removed
    }

    fn insert(&self, key: String, rate: Rate) {
        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(&key) {
            self.evict_expired();
            if self.entries.len() >= self.config.max_entries {
                self.evict_oldest();
            }
        }
        self.entries.insert(key, CacheEntry::new(rate, self.config.ttl));
    }

    /// Remove every expired entry.
    pub fn evict_expired(&self) {
        self.entries.retain(|_, entry| entry.is_valid());
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().cached_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.entries.len();
        let valid = self.entries.iter().filter(|e| e.is_valid()).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }
}

impl Default for InMemoryRateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateCache for InMemoryRateCache {
    async fn cache_raw_rate(&self, rate: &Rate) -> EngineResult<()> {
        let provider = rate
            .provider_name
            .as_deref()
            .ok_or_else(|| EngineError::Cache(format!("raw rate {} has no provider", rate.symbol)))?;
        self.insert(Self::raw_key(&rate.base_symbol(), provider), rate.clone());
        Ok(())
    }

    async fn cache_calculated_rate(&self, rate: &Rate) -> EngineResult<()> {
        self.insert(Self::calculated_key(&rate.symbol), rate.clone());
        Ok(())
    }

    async fn get_calculated_rate(&self, symbol: &str) -> EngineResult<Option<Rate>> {
        Ok(self.get(&Self::calculated_key(symbol)))
    }

    async fn get_raw_rates_for_symbol(
        &self,
        symbol: &str,
        providers: &[String],
    ) -> EngineResult<HashMap<String, Rate>> {
        let base = symbol::normalize(symbol);
        Ok(providers
            .iter()
            .filter_map(|p| self.get(&Self::raw_key(&base, p)).map(|r| (p.clone(), r)))
            .collect())
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

/// Shared cache handle.
pub type SharedRateCache = Arc<dyn RateCache>;
