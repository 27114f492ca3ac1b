//! Node state definitions.

/// Node operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Rules loaded, background tasks not yet running.
    Starting,
    /// Accepting ticks.
    Running,
    /// Draining in-flight pipeline runs, new ticks are refused.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

impl NodeState {
    /// Check if the node is accepting ticks.
    pub fn accepts_ticks(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    /// Check if the node is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Stopped)
    }
}
