//! Capability traits the orchestration core depends on but never
//! implements itself — the boundary where a concrete LLM client, VCS
//! binding, or human-review channel gets substituted in.
//!
//! Narrow `#[async_trait]` traits, one per collaborator, mirroring how
//! the rest of the pack wires mockable boundaries for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{StageError, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    ToolUse,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub thinking_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub extended_thinking: bool,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub thinking: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Thinking(String),
    ToolUse(ToolCall),
    Done,
    Error(String),
}

/// Kinds of non-recoverable or retryable backend failure an `LLMClient`
/// may raise. `recoverable` tells the caller (QA loop, coordinator)
/// whether it's worth retrying with another backend.
#[derive(Debug, thiserror::Error)]
pub enum LlmBackendError {
    #[error("CLI backend not found")]
    CliNotFound,
    #[error("CLI backend auth failure")]
    CliAuth,
    #[error("CLI backend timed out")]
    CliTimeout,
    #[error("API key missing")]
    ApiKeyMissing,
    #[error("rate limited, retry after {retry_after_ms:?}ms")]
    RateLimit { retry_after_ms: Option<u64> },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl LlmBackendError {
    pub fn recoverable(&self) -> bool {
        !matches!(self, LlmBackendError::BackendUnavailable(_))
    }
}

#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmBackendError>;

    async fn chat_stream(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, LlmBackendError>;

    /// Approximate token count; not required to be exact.
    fn count_tokens(&self, text: &str) -> u32;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: serde_json::Value) -> ToolOutcome;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyResult {
    pub success: bool,
    pub errors: Vec<StageError>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

#[async_trait]
pub trait BuildVerifier: Send + Sync {
    async fn verify(&self, worktree_path: &str) -> VerifyResult;
}

#[async_trait]
pub trait LintRunner: Send + Sync {
    async fn lint(&self, worktree_path: &str) -> VerifyResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailure {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failures: Vec<TestFailure>,
    pub duration_ms: u64,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, worktree_path: &str, test_criteria: &[String]) -> TestResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    pub has_blocking_issues: bool,
    pub issues: Vec<ReviewIssue>,
    pub summary: String,
}

#[async_trait]
pub trait CodeReviewer: Send + Sync {
    async fn review(&self, worktree_path: &str, task: &Task) -> ReviewResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub commit_hash: Option<String>,
    pub error: Option<String>,
    pub conflict_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResult {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeHandle {
    pub path: String,
    pub branch: String,
}

#[async_trait]
pub trait VcsWorktree: Send + Sync {
    async fn create_worktree(&self, task_id: &TaskId) -> Result<WorktreeHandle, String>;
    async fn remove_worktree(&self, task_id: &TaskId) -> Result<(), String>;
    async fn get_worktree(&self, task_id: &TaskId) -> Option<WorktreeHandle>;
    async fn list_worktrees(&self) -> Vec<WorktreeHandle>;
    async fn merge(&self, source_path: &str, target_branch: &str) -> MergeResult;
    async fn push_to_remote(&self, branch: &str) -> PushResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningTask {
    pub name: String,
    pub description: String,
    pub files: Vec<String>,
    pub test_criteria: Vec<String>,
    pub estimated_minutes: u32,
    pub depends_on: Vec<String>,
}

#[async_trait]
pub trait TaskDecomposer: Send + Sync {
    async fn decompose(&self, description: &str) -> Result<Vec<PlanningTask>, String>;
}

pub trait DependencyResolver: Send + Sync {
    fn detect_cycles(&self, tasks: &[Task]) -> Option<Vec<TaskId>>;
    fn calculate_waves(&self, tasks: &mut [Task]) -> Result<(), String>;
    fn topological_sort(&self, tasks: &[Task]) -> Result<Vec<TaskId>, String>;
}

/// Informational only — never gates scheduling decisions.
pub trait TimeEstimator: Send + Sync {
    fn estimate_minutes(&self, task: &Task) -> u32;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHandle {
    pub id: String,
    pub git_commit: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait CheckpointManager: Send + Sync {
    async fn create_checkpoint(
        &self,
        project_id: &str,
        reason: &str,
    ) -> Result<CheckpointHandle, String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequestParams {
    pub task_id: TaskId,
    pub project_id: String,
    pub reason: String,
    pub context: HashMap<String, String>,
}

#[async_trait]
pub trait HumanReviewService: Send + Sync {
    async fn request_review(&self, params: ReviewRequestParams) -> Result<String, String>;
}
