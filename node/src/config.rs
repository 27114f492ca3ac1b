//! Node configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fxrelay_common::time::constants;
use fxrelay_engine::{AggregatorConfig, CacheConfig, PipelineConfig, ValidationConfig};
use rust_decimal::Decimal;

/// Main node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node ID; generated at startup when absent.
    pub node_id: Option<String>,
    /// Rule configuration file (symbol configs and calculation rules).
    pub rules_path: PathBuf,
    /// Directory formula implementations are resolved against.
    pub script_root: PathBuf,
    /// Maximum pipeline runs executing at once.
    pub workers: usize,
    /// Aggregator settings.
    pub aggregator: AggregatorConfig,
    /// Raw rate validation limits.
    pub validation: ValidationConfig,
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
    /// Calculated-rate cache settings.
    pub cache: CacheConfig,
    /// Interval between cache evictions and metrics reports.
    pub maintenance_interval: Duration,
    /// How long shutdown waits for in-flight runs.
    pub drain_timeout: Duration,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            rules_path: PathBuf::from("config/rules.json"),
            script_root: PathBuf::from("scripts"),
            workers: 4,
            aggregator: AggregatorConfig::default(),
            validation: ValidationConfig::default(),
            pipeline: PipelineConfig::default(),
            cache: CacheConfig::default(),
            maintenance_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl NodeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("FXRELAY_NODE_ID") {
            config.node_id = Some(id);
        }

        if let Ok(path) = std::env::var("FXRELAY_RULES_PATH") {
            config.rules_path = PathBuf::from(path);
        }

        if let Ok(root) = std::env::var("FXRELAY_SCRIPT_ROOT") {
            config.script_root = PathBuf::from(root);
        }

        if let Some(workers) = env_parse("FXRELAY_WORKERS") {
            config.workers = workers;
        }

        if let Some(skew) = env_parse("FXRELAY_MAX_TIME_SKEW_MS") {
            config.aggregator.max_time_skew_ms = skew;
        }

        if let Some(multiplier) = env_parse("FXRELAY_STALE_MULTIPLIER") {
            config.aggregator.stale_multiplier = multiplier;
        }

        if let Some(secs) = env_parse("FXRELAY_SWEEP_INTERVAL_SECS") {
            config.aggregator.sweep_interval = Duration::from_secs(secs);
        }

        if let Some(enabled) = env_parse("FXRELAY_VALIDATION_ENABLED") {
            config.validation.enabled = enabled;
        }

        if let Some(ratio) = env_parse::<Decimal>("FXRELAY_MAX_SPREAD_RATIO") {
            config.validation.max_spread_ratio = ratio;
        }

        if let Some(ms) = env_parse("FXRELAY_RUN_BUDGET_MS") {
            config.pipeline.run_budget = Duration::from_millis(ms);
        }

        if let Ok(level) = std::env::var("FXRELAY_LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("Worker count cannot be 0".to_string());
        }

        if self.aggregator.max_time_skew_ms <= 0 {
            return Err("Max time skew must be positive".to_string());
        }

        if self.aggregator.stale_multiplier < 1 {
            return Err("Stale multiplier must be at least 1".to_string());
        }

        if self.aggregator.sweep_interval.is_zero() {
            return Err("Sweep interval cannot be 0".to_string());
        }

        if self.maintenance_interval.is_zero() {
            return Err("Maintenance interval cannot be 0".to_string());
        }

        if self.validation.max_spread_ratio <= Decimal::ZERO {
            return Err("Max spread ratio must be positive".to_string());
        }

        if self.rules_path.as_os_str().is_empty() {
            return Err("Rules path cannot be empty".to_string());
        }

        if self.pipeline.run_budget > constants::sweep_interval() {
            return Err("Run budget cannot exceed the sweep interval".to_string());
        }

        Ok(())
    }
}
