//! FxRelay Engine
//!
//! Turns per-provider FX ticks into consensus and cross rates.
//!
//! # Features
//!
//! - Time-windowed aggregation of raw quotes with a skew tolerance
//! - Declarative AVG/CROSS rules with a dependency-checked trigger map
//! - Averaging and formula strategies
//! - Fault-isolated four-stage calculation pipeline publishing ordered snapshots
//!
//! # Example
//!
//! ```rust,ignore
//! use fxrelay_engine::*;
//!
//! let formula = Arc::new(FormulaStrategy::new("scripts"));
//! let rules = Arc::new(RuleEngine::new(StrategyRegistry::with_defaults(
//!     AverageStrategy::default(),
//!     formula,
//! )));
//! let providers = SymbolProviders::new();
//! RuleConfig::load("config/rules.json")?.apply(&rules, &providers)?;
//!
//! let pipeline = Arc::new(CalculationPipeline::new(
//!     cache, publisher, rules, providers.clone(), PipelineConfig::default(),
//! ));
//! let aggregator = WindowAggregator::new(
//!     providers, RateValidator::default(), pipeline, AggregatorConfig::default(),
//! );
//! aggregator.accept(rate).await;
//! ```

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod publisher;
pub mod rules;
pub mod script;
pub mod strategy;
pub mod validation;

pub use aggregator::{AcceptOutcome, AggregatorConfig, WindowAggregator, WindowBatch, WindowTrigger};
pub use cache::{CacheConfig, InMemoryRateCache, RateCache, SharedRateCache};
pub use config::RuleConfig;
pub use error::{EngineError, EngineResult};
pub use pipeline::{CalculationPipeline, ExecutionContext, PipelineConfig};
pub use providers::{SymbolConfig, SymbolProviders};
pub use publisher::{ChannelPublisher, PublishedEvent, RatePublisher, SharedRatePublisher};
pub use rules::{CalculationRule, RuleEngine, RuleSet, RuleType, StrategyRegistry};
pub use script::{FormulaError, Script};
pub use strategy::{AverageStrategy, CalculationStrategy, FormulaStrategy};
pub use validation::{RateValidator, ValidationConfig};
