//! Error taxonomy for the orchestration core.
//!
//! Each subsystem gets its own error enum so a caller can match on the
//! failure domain.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task {0} already queued")]
    DuplicateTask(String),

    #[error("task {0} not found")]
    UnknownTask(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no idle agent of type {0:?} available")]
    NoIdleAgent(crate::domain::AgentType),

    #[error("agent pool at capacity for {0:?} ({1} active)")]
    AtCapacity(crate::domain::AgentType, usize),

    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("agent {0} is not idle")]
    AgentNotIdle(String),
}
