//! Node error types.

use fxrelay_engine::EngineError;
use thiserror::Error;

use crate::state::NodeState;

/// Errors raised by the node service.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Engine failure, typically while loading rules.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Invalid node configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not allowed in the current state.
    #[error("Node is {0:?}")]
    NotRunning(NodeState),

    /// Tick input could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
