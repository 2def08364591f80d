//! Coordination primitives for the orchestration core.
//!
//! This crate provides the parts shared between the orchestrator binary
//! and any host embedding it:
//!
//! - `domain`: the data model (tasks, waves, agents, worktrees, QA
//!   iterations, checkpoints, review requests).
//! - `contracts`: the capability traits the core depends on
//!   (`LLMClient`, `ToolExecutor`, `BuildVerifier`, `VcsWorktree`, ...).
//! - `error`: the error taxonomy.
//! - `config`: `ProjectConfig` loading and defaults.
//! - `events`: the pub/sub event bus and event taxonomy.
//! - `feedback`: compiler invocation and rustc error classification,
//!   feeding the QA loop's repair step.
//! - `verifier`: structured gate results aggregated across QA stages.

#![allow(dead_code)]

pub mod config;
pub mod contracts;
pub mod domain;
pub mod error;
pub mod events;
pub mod feedback;
pub mod verifier;

pub use config::{OrchestrationMode, ProjectConfig, ProjectSettings};
pub use domain::{
    Agent, AgentId, AgentMetrics, AgentStatus, AgentType, Checkpoint, QaIteration, ReviewId,
    ReviewRequest, ReviewStatus, StageError, StageKind, StageResult, Task, TaskId, TaskStatus,
    Wave, WaveId, Worktree,
};
pub use error::{PoolError, QueueError};
pub use events::{EventBus, EventFilter, OrchestratorEvent, SharedEventBus};
pub use feedback::{ErrorCategory, ErrorSummary, ParsedError, RustcErrorParser};
pub use verifier::{FailureSignal, GateOutcome, GateResult, VerifierReport};
