//! Placeholder runner for roles that never execute tasks directly
//! (`Planner`). Decomposition happens once, ahead of the wave loop, via
//! `coordination::contracts::TaskDecomposer` — not through the
//! `AgentRunner` roster.

use async_trait::async_trait;
use coordination::domain::{StageError, Task};

use super::{AgentRunner, RunnerContext, RunnerError, TaskResult};

pub struct NoRunner;

#[async_trait]
impl AgentRunner for NoRunner {
    async fn execute(&self, _task: &Task, _ctx: &RunnerContext) -> Result<TaskResult, RunnerError> {
        Err(RunnerError::NoRunner)
    }

    async fn fix_issues(&self, _errors: &[StageError]) -> Result<TaskResult, RunnerError> {
        Err(RunnerError::NoRunner)
    }
}
