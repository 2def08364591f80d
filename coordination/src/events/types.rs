//! Event types produced by the orchestration core.
//!
//! Events are the only channel observers see; the core never shares
//! mutable state with them. Each event carries an exact `event_type()`
//! matching the taxonomy's `group:name` convention (e.g. `task:completed`)
//! so downstream tooling can route on the string without re-deriving it
//! from the serde tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for events.
pub type EventId = String;

/// Why a checkpoint creation failed (non-fatal, logged and emitted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFailure {
    pub wave_id: u32,
    pub error: String,
}

/// Why an agent was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Shutdown,
    PoolReap,
    Error,
}

/// All events the orchestration core emits.
///
/// Every task-scoped event tracks `task_id`; every project-scoped event
/// tracks `project_id`. Accessors below let a subscriber filter without
/// matching every variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    CoordinatorStarted {
        project_id: String,
        timestamp: DateTime<Utc>,
    },
    CoordinatorPaused {
        project_id: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    CoordinatorResumed {
        project_id: String,
        timestamp: DateTime<Utc>,
    },
    CoordinatorStopped {
        project_id: String,
        timestamp: DateTime<Utc>,
    },

    WaveStarted {
        project_id: String,
        wave_id: u32,
        timestamp: DateTime<Utc>,
    },
    WaveCompleted {
        project_id: String,
        wave_id: u32,
        timestamp: DateTime<Utc>,
    },

    TaskStarted {
        project_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskAssigned {
        project_id: String,
        task_id: String,
        agent_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        project_id: String,
        task_id: String,
        human_approved: bool,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        project_id: String,
        task_id: String,
        human_rejected: bool,
        feedback: Option<String>,
        timestamp: DateTime<Utc>,
    },
    TaskEscalated {
        project_id: String,
        task_id: String,
        reason: String,
        review_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    TaskMerged {
        project_id: String,
        task_id: String,
        commit_hash: String,
        timestamp: DateTime<Utc>,
    },
    TaskMergeFailed {
        project_id: String,
        task_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TaskPushed {
        project_id: String,
        task_id: String,
        branch: String,
        timestamp: DateTime<Utc>,
    },

    AgentSpawned {
        agent_id: String,
        agent_type: String,
        timestamp: DateTime<Utc>,
    },
    AgentTerminated {
        agent_id: String,
        reason: TerminationReason,
        tasks_completed: u32,
        tasks_failed: u32,
        timestamp: DateTime<Utc>,
    },
    AgentIdle {
        agent_id: String,
        idle_since: DateTime<Utc>,
    },
    AgentReleased {
        agent_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    AgentError {
        agent_id: String,
        error: String,
        recoverable: bool,
        timestamp: DateTime<Utc>,
    },

    CheckpointCreated {
        project_id: String,
        checkpoint_id: String,
        wave_id: u32,
        timestamp: DateTime<Utc>,
    },
    CheckpointFailed {
        project_id: String,
        failure: CheckpointFailure,
        timestamp: DateTime<Utc>,
    },

    OrchestrationMode {
        project_id: String,
        mode: String,
        timestamp: DateTime<Utc>,
    },

    EvolutionAnalyzing {
        project_id: String,
        timestamp: DateTime<Utc>,
    },
    EvolutionAnalyzed {
        project_id: String,
        files_scanned: usize,
        timestamp: DateTime<Utc>,
    },
    EvolutionAnalysisFailed {
        project_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    ProjectCompleted {
        project_id: String,
        total_tasks: usize,
        completed_tasks: usize,
        failed_tasks: usize,
        timestamp: DateTime<Utc>,
    },
    ProjectFailed {
        project_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    ReviewRequested {
        project_id: String,
        review_id: String,
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    /// Canonical `group:name` event type string, per the spec taxonomy.
    pub fn event_type(&self) -> &'static str {
        use OrchestratorEvent::*;
        match self {
            CoordinatorStarted { .. } => "coordinator:started",
            CoordinatorPaused { .. } => "coordinator:paused",
            CoordinatorResumed { .. } => "coordinator:resumed",
            CoordinatorStopped { .. } => "coordinator:stopped",
            WaveStarted { .. } => "wave:started",
            WaveCompleted { .. } => "wave:completed",
            TaskStarted { .. } => "task:started",
            TaskAssigned { .. } => "task:assigned",
            TaskCompleted { .. } => "task:completed",
            TaskFailed { .. } => "task:failed",
            TaskEscalated { .. } => "task:escalated",
            TaskMerged { .. } => "task:merged",
            TaskMergeFailed { .. } => "task:merge-failed",
            TaskPushed { .. } => "task:pushed",
            AgentSpawned { .. } => "agent:spawned",
            AgentTerminated { .. } => "agent:terminated",
            AgentIdle { .. } => "agent:idle",
            AgentReleased { .. } => "agent:released",
            AgentError { .. } => "agent:error",
            CheckpointCreated { .. } => "checkpoint:created",
            CheckpointFailed { .. } => "checkpoint:failed",
            OrchestrationMode { .. } => "orchestration:mode",
            EvolutionAnalyzing { .. } => "evolution:analyzing",
            EvolutionAnalyzed { .. } => "evolution:analyzed",
            EvolutionAnalysisFailed { .. } => "evolution:analysis-failed",
            ProjectCompleted { .. } => "project:completed",
            ProjectFailed { .. } => "project:failed",
            ReviewRequested { .. } => "review:requested",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        use OrchestratorEvent::*;
        match self {
            CoordinatorStarted { timestamp, .. }
            | CoordinatorPaused { timestamp, .. }
            | CoordinatorResumed { timestamp, .. }
            | CoordinatorStopped { timestamp, .. }
            | WaveStarted { timestamp, .. }
            | WaveCompleted { timestamp, .. }
            | TaskStarted { timestamp, .. }
            | TaskAssigned { timestamp, .. }
            | TaskCompleted { timestamp, .. }
            | TaskFailed { timestamp, .. }
            | TaskEscalated { timestamp, .. }
            | TaskMerged { timestamp, .. }
            | TaskMergeFailed { timestamp, .. }
            | TaskPushed { timestamp, .. }
            | AgentSpawned { timestamp, .. }
            | AgentTerminated { timestamp, .. }
            | AgentReleased { timestamp, .. }
            | AgentError { timestamp, .. }
            | CheckpointCreated { timestamp, .. }
            | CheckpointFailed { timestamp, .. }
            | OrchestrationMode { timestamp, .. }
            | EvolutionAnalyzing { timestamp, .. }
            | EvolutionAnalyzed { timestamp, .. }
            | EvolutionAnalysisFailed { timestamp, .. }
            | ProjectCompleted { timestamp, .. }
            | ProjectFailed { timestamp, .. }
            | ReviewRequested { timestamp, .. } => *timestamp,
            AgentIdle { idle_since, .. } => *idle_since,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        use OrchestratorEvent::*;
        match self {
            CoordinatorStarted { project_id, .. }
            | CoordinatorPaused { project_id, .. }
            | CoordinatorResumed { project_id, .. }
            | CoordinatorStopped { project_id, .. }
            | WaveStarted { project_id, .. }
            | WaveCompleted { project_id, .. }
            | TaskStarted { project_id, .. }
            | TaskAssigned { project_id, .. }
            | TaskCompleted { project_id, .. }
            | TaskFailed { project_id, .. }
            | TaskEscalated { project_id, .. }
            | TaskMerged { project_id, .. }
            | TaskMergeFailed { project_id, .. }
            | TaskPushed { project_id, .. }
            | CheckpointCreated { project_id, .. }
            | CheckpointFailed { project_id, .. }
            | OrchestrationMode { project_id, .. }
            | EvolutionAnalyzing { project_id, .. }
            | EvolutionAnalyzed { project_id, .. }
            | EvolutionAnalysisFailed { project_id, .. }
            | ProjectCompleted { project_id, .. }
            | ProjectFailed { project_id, .. }
            | ReviewRequested { project_id, .. } => Some(project_id),
            AgentSpawned { .. } | AgentTerminated { .. } | AgentIdle { .. }
            | AgentReleased { .. } | AgentError { .. } => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        use OrchestratorEvent::*;
        match self {
            TaskStarted { task_id, .. }
            | TaskAssigned { task_id, .. }
            | TaskCompleted { task_id, .. }
            | TaskFailed { task_id, .. }
            | TaskEscalated { task_id, .. }
            | TaskMerged { task_id, .. }
            | TaskMergeFailed { task_id, .. }
            | TaskPushed { task_id, .. }
            | ReviewRequested { task_id, .. } => Some(task_id),
            AgentReleased { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_taxonomy_prefix() {
        let ev = OrchestratorEvent::TaskMergeFailed {
            project_id: "p1".into(),
            task_id: "t1".into(),
            error: "conflict".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(ev.event_type(), "task:merge-failed");
        assert_eq!(ev.task_id(), Some("t1"));
        assert_eq!(ev.project_id(), Some("p1"));
    }

    #[test]
    fn agent_events_have_no_project_id() {
        let ev = OrchestratorEvent::AgentIdle {
            agent_id: "a1".into(),
            idle_since: Utc::now(),
        };
        assert_eq!(ev.project_id(), None);
        assert!(ev.timestamp() <= Utc::now());
    }
}
