//! Core data model: tasks, waves, agents, worktrees, QA iterations,
//! checkpoints, and review requests.
//!
//! Every cross-entity link is a plain `String` id resolved through the
//! owning container's lookup map rather than a direct reference — no
//! entity here ever borrows another. This keeps every owning container
//! (queue, pool, worktree manager) free to take `&mut` on its own
//! entities without a borrow-checker fight, at the cost of an extra hash
//! lookup per cross-entity operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type TaskId = String;
pub type AgentId = String;
pub type ReviewId = String;
pub type WaveId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Working,
    Completed,
    Failed,
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub files: Vec<String>,
    pub test_criteria: Vec<String>,
    pub estimated_minutes: u32,
    pub priority: i32,
    pub depends_on: Vec<TaskId>,
    pub wave_id: WaveId,
    pub status: TaskStatus,
}

impl Task {
    /// `waveId(t) > max(waveId(d) for d in dependsOn(t))`, or 0 when
    /// `dependsOn` is empty.
    pub fn is_ready(&self, completed: &std::collections::HashSet<TaskId>) -> bool {
        self.depends_on.iter().all(|d| completed.contains(d))
    }
}

/// An ordered set of tasks sharing a wave id, releasable in parallel.
#[derive(Debug, Clone, Default)]
pub struct Wave {
    pub id: WaveId,
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Coder,
    Tester,
    Reviewer,
    Merger,
    Planner,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Coder => "coder",
            AgentType::Tester => "tester",
            AgentType::Reviewer => "reviewer",
            AgentType::Merger => "merger",
            AgentType::Planner => "planner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Assigned,
    Working,
    Terminated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub qa_iterations_total: u32,
    pub tokens_consumed: u64,
    pub wall_time_active_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_task_id: Option<TaskId>,
    pub worktree_path: Option<String>,
    pub metrics: AgentMetrics,
    pub spawned_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: AgentId, agent_type: AgentType) -> Self {
        let now = Utc::now();
        Self {
            id,
            agent_type,
            status: AgentStatus::Idle,
            current_task_id: None,
            worktree_path: None,
            metrics: AgentMetrics::default(),
            spawned_at: now,
            last_active_at: now,
        }
    }
}

/// One worktree per in-flight task: exists strictly between assignment
/// and termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub task_id: TaskId,
    pub path: String,
    pub branch: String,
    pub base_commit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Build,
    Lint,
    Test,
    Review,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub message: String,
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub success: bool,
    pub errors: Vec<StageError>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// A monotonically numbered attempt within a task's QA loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaIteration {
    pub iteration: u32,
    pub stages: Vec<StageResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub project_id: String,
    pub wave_id: WaveId,
    pub completed_task_ids: Vec<TaskId>,
    pub pending_task_ids: Vec<TaskId>,
    pub coordinator_state: String,
    pub vcs_commit: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: ReviewId,
    pub task_id: TaskId,
    pub project_id: String,
    pub reason: String,
    pub context: HashMap<String, String>,
    pub status: ReviewStatus,
    pub resolution: Option<String>,
    pub feedback: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            files: vec![],
            test_criteria: vec![],
            estimated_minutes: 10,
            priority: 0,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            wave_id: 0,
            status: TaskStatus::Pending,
        }
    }

    #[test]
    fn task_without_deps_is_always_ready() {
        let t = task("t1", &[]);
        assert!(t.is_ready(&HashSet::new()));
    }

    #[test]
    fn task_with_unmet_deps_is_not_ready() {
        let t = task("t2", &["t1"]);
        assert!(!t.is_ready(&HashSet::new()));
        let mut completed = HashSet::new();
        completed.insert("t1".to_string());
        assert!(t.is_ready(&completed));
    }
}
