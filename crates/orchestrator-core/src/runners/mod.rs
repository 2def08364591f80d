//! Agent runners: translate "execute this task" into a bounded
//! conversation with an `LLMClient`, interleaving tool calls through a
//! `ToolExecutor`.
//!
//! One trait, five implementations, kept as a trait-object roster
//! (`HashMap<AgentType, Arc<dyn AgentRunner>>`) rather than an enum
//! match, since each runner carries distinct construction-time state
//! (tool whitelist, role prompt, preferred model).

pub mod coder;
pub mod merger;
pub mod no_runner;
pub mod reviewer;
pub mod tester;

use async_trait::async_trait;
use coordination::contracts::LlmBackendError;
use coordination::domain::{StageError, Task};

pub use coder::CoderRunner;
pub use merger::MergerRunner;
pub use no_runner::NoRunner;
pub use reviewer::ReviewerRunner;
pub use tester::TesterRunner;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no active task to resume — call execute before fix_issues")]
    NoActiveTask,
    #[error("this role has no runner")]
    NoRunner,
    #[error(transparent)]
    Backend(#[from] LlmBackendError),
}

#[derive(Debug, Clone, Default)]
pub struct TaskMetrics {
    pub iterations: u32,
    pub tokens_used: u32,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub files_modified: Vec<String>,
    pub metrics: TaskMetrics,
}

/// Per-call context a runner needs beyond the task itself.
pub struct RunnerContext {
    pub worktree_path: String,
    /// Sentinel substring that ends the conversation loop early.
    pub completion_sentinel: String,
    /// Per-task bound on LLM calls (default 25 per §4.3).
    pub max_llm_calls: u32,
}

impl Default for RunnerContext {
    fn default() -> Self {
        Self {
            worktree_path: String::new(),
            completion_sentinel: "[TASK_COMPLETE]".to_string(),
            max_llm_calls: 25,
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &RunnerContext) -> Result<TaskResult, RunnerError>;

    async fn fix_issues(&self, errors: &[StageError]) -> Result<TaskResult, RunnerError>;
}

/// Tool whitelist by role, per §4.3.
pub fn tool_whitelist(agent_type: coordination::domain::AgentType) -> &'static [&'static str] {
    use coordination::domain::AgentType::*;
    match agent_type {
        Coder | Tester => &[
            "read_file",
            "write_file",
            "edit_file",
            "run_command",
            "search_code",
            "list_files",
        ],
        Reviewer => &["read_file", "search_code", "list_files"],
        Merger => &["read_file", "run_command", "write_file"],
        Planner => &[],
    }
}
