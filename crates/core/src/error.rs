use thiserror::Error;

/// Failures surfaced by the supervisor's public operations.
#[derive(Debug, Error, PartialEq)]
pub enum SupervisorError {
    #[error("agent {0} not found")]
    NotFound(String),
    #[error("maximum number of agents ({0}) reached")]
    Capacity(usize),
    #[error("invalid agent configuration: {0}")]
    InvalidConfig(String),
    #[error("agent manager is not running")]
    NotRunning,
    #[error("agent {0} is stopping")]
    Busy(String),
    #[error("agent not found or not running")]
    AgentNotRunning,
    #[error("agent not connected")]
    NotConnected,
    #[error("agent already joined meeting")]
    AlreadyJoined,
    #[error("agent {0} is not in analyst mode")]
    NotAnalyst(String),
}
