//! FxRelay node
//!
//! Runs the windowed aggregator and the calculation pipeline as a service:
//! ticks arrive as JSON lines, complete windows are dispatched onto a bounded
//! worker pool, and published snapshots are drained by a sink.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod service;
pub mod sink;
pub mod state;

pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use service::RateService;
pub use state::NodeState;
