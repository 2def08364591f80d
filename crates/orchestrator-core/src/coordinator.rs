//! The top-level orchestration state machine: owns the wave loop, wires
//! the task queue, agent pool, QA loop and worktree manager together,
//! and fans events out over the shared bus.
//!
//! Grounded on the teacher's broadcast-backed `EventBus` plus its
//! session-manager-style subscribe/dispatch split: `subscribe()` hands
//! back a receiver directly rather than registering a closure, since a
//! `tokio::sync::broadcast::Receiver` already gives callers the
//! "isolated from other listeners" property the teacher got from
//! spawning one task per handler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use coordination::contracts::{
    BuildVerifier, CodeReviewer, HumanReviewService, LintRunner, ReviewRequestParams,
    TaskDecomposer, TestRunner, VcsWorktree,
};
use coordination::domain::{AgentType, Task, TaskId, TaskStatus, Wave};
use coordination::{EventBus, OrchestrationMode, OrchestratorEvent, ProjectConfig, ProjectSettings};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::warn;
use uuid::Uuid;

use crate::agent_pool::AgentPool;
use crate::qa_loop::{self, QaOutcome};
use crate::runners::RunnerContext;
use crate::task_queue::TaskQueue;
use crate::worktree_manager::WorktreeManager;

/// The deterministic quality gates a coder task passes through before
/// merge, bundled so `Coordinator::new` takes one optional collaborator
/// instead of three. Absent entirely when the harness has no build/lint/
/// test backend bound — tasks then merge straight off the coder's own
/// `execute` result, same as before this existed.
pub struct QaGates {
    pub build: Arc<dyn BuildVerifier>,
    pub lint: Arc<dyn LintRunner>,
    pub test: Arc<dyn TestRunner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
    Paused,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    Execution,
    Completion,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator is not idle")]
    NotIdle,
    #[error("no project initialized")]
    NotInitialized,
    #[error("decomposition failed: {0}")]
    DecompositionFailed(String),
    #[error("unknown review id: {0}")]
    UnknownReview(String),
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub current_wave: u32,
}

struct EscalatedReview {
    task_id: TaskId,
    agent_id: String,
    worktree_path: Option<String>,
    resumed_pause: bool,
}

struct Counters {
    total: usize,
    completed: usize,
    failed: usize,
}

pub struct Coordinator {
    project_id: String,
    project_path: PathBuf,
    mode: OrchestrationMode,
    settings: ProjectSettings,

    queue: Arc<TaskQueue>,
    pool: Arc<AgentPool>,
    worktrees: Arc<WorktreeManager>,
    events: Arc<EventBus>,

    decomposer: Option<Arc<dyn TaskDecomposer>>,
    reviewer: Option<Arc<dyn CodeReviewer>>,
    review_service: Option<Arc<dyn HumanReviewService>>,
    qa_gates: Option<Arc<QaGates>>,

    state: Arc<RwLock<CoordinatorState>>,
    phase: RwLock<Phase>,
    stop_requested: Arc<AtomicBool>,
    pause_requested: Arc<AtomicBool>,

    counters: Arc<Mutex<Counters>>,
    pending_reviews: Arc<Mutex<HashMap<String, EscalatedReview>>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProjectConfig,
        pool: Arc<AgentPool>,
        worktrees: Arc<WorktreeManager>,
        events: Arc<EventBus>,
        decomposer: Option<Arc<dyn TaskDecomposer>>,
        reviewer: Option<Arc<dyn CodeReviewer>>,
        review_service: Option<Arc<dyn HumanReviewService>>,
        qa_gates: Option<Arc<QaGates>>,
    ) -> Self {
        Self {
            project_id: config.project_id,
            project_path: config.project_path,
            mode: config.mode,
            settings: config.settings,
            queue: Arc::new(TaskQueue::new()),
            pool,
            worktrees,
            events,
            decomposer,
            reviewer,
            review_service,
            qa_gates,
            state: Arc::new(RwLock::new(CoordinatorState::Idle)),
            phase: RwLock::new(Phase::Planning),
            stop_requested: Arc::new(AtomicBool::new(false)),
            pause_requested: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Mutex::new(Counters {
                total: 0,
                completed: 0,
                failed: 0,
            })),
            pending_reviews: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.publish(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> CoordinatorState {
        *self.state.read().await
    }

    pub async fn progress(&self) -> Progress {
        let counters = self.counters.lock().await;
        Progress {
            total_tasks: counters.total,
            completed_tasks: counters.completed,
            failed_tasks: counters.failed,
            current_wave: self.queue.current_wave(),
        }
    }

    pub async fn active_agents(&self) -> Vec<coordination::Agent> {
        self.pool.get_all().await
    }

    pub fn pending_tasks(&self) -> Vec<Task> {
        self.queue.get_ready_tasks()
    }

    /// `executeExistingTasks`: skips decomposition entirely.
    pub async fn execute_existing_tasks(
        &self,
        tasks: Vec<Task>,
    ) -> Result<(), CoordinatorError> {
        if *self.state.read().await != CoordinatorState::Idle {
            return Err(CoordinatorError::NotIdle);
        }
        self.enqueue_all(tasks).await;
        self.run_to_completion().await;
        Ok(())
    }

    /// `start`: full genesis/evolution decomposition over `features`.
    pub async fn start(&self, features: Vec<String>) -> Result<(), CoordinatorError> {
        if *self.state.read().await != CoordinatorState::Idle {
            return Err(CoordinatorError::NotIdle);
        }
        *self.phase.write().await = Phase::Planning;

        self.emit(OrchestratorEvent::OrchestrationMode {
            project_id: self.project_id.clone(),
            mode: match self.mode {
                OrchestrationMode::Genesis => "genesis".to_string(),
                OrchestrationMode::Evolution => "evolution".to_string(),
            },
            timestamp: Utc::now(),
        });

        let Some(decomposer) = self.decomposer.clone() else {
            return Err(CoordinatorError::DecompositionFailed(
                "no task decomposer bound".to_string(),
            ));
        };

        let mut all_tasks = Vec::new();
        for feature in &features {
            let description = match self.mode {
                OrchestrationMode::Genesis => feature.clone(),
                OrchestrationMode::Evolution => {
                    self.emit(OrchestratorEvent::EvolutionAnalyzing {
                        project_id: self.project_id.clone(),
                        timestamp: Utc::now(),
                    });
                    format!("{feature}\n\nEvolution: verify compatibility with existing code")
                }
            };

            match decomposer.decompose(&description).await {
                Ok(planned) => {
                    if matches!(self.mode, OrchestrationMode::Evolution) {
                        self.emit(OrchestratorEvent::EvolutionAnalyzed {
                            project_id: self.project_id.clone(),
                            files_scanned: 0,
                            timestamp: Utc::now(),
                        });
                    }
                    for p in planned {
                        all_tasks.push(Task {
                            id: Uuid::new_v4().to_string(),
                            name: p.name,
                            description: p.description,
                            files: p.files,
                            test_criteria: if matches!(self.mode, OrchestrationMode::Evolution) {
                                let mut tc = p.test_criteria;
                                tc.push(
                                    "Evolution: verify compatibility with existing code"
                                        .to_string(),
                                );
                                tc
                            } else {
                                p.test_criteria
                            },
                            estimated_minutes: p.estimated_minutes,
                            priority: 0,
                            depends_on: p.depends_on,
                            wave_id: 0,
                            status: TaskStatus::Pending,
                        });
                    }
                }
                Err(e) => {
                    if matches!(self.mode, OrchestrationMode::Evolution) {
                        self.emit(OrchestratorEvent::EvolutionAnalysisFailed {
                            project_id: self.project_id.clone(),
                            error: e.clone(),
                            timestamp: Utc::now(),
                        });
                        continue;
                    }
                    return Err(CoordinatorError::DecompositionFailed(e));
                }
            }
        }

        calculate_waves(&mut all_tasks);
        self.enqueue_all(all_tasks).await;
        self.run_to_completion().await;
        Ok(())
    }

    async fn enqueue_all(&self, tasks: Vec<Task>) {
        let mut counters = self.counters.lock().await;
        counters.total += tasks.len();
        drop(counters);
        for task in tasks {
            let wave = task.wave_id;
            if let Err(e) = self.queue.enqueue(task, Some(wave)) {
                warn!(error = %e, "failed to enqueue task");
            }
        }
    }

    async fn run_to_completion(&self) {
        *self.state.write().await = CoordinatorState::Running;
        *self.phase.write().await = Phase::Execution;
        self.emit(OrchestratorEvent::CoordinatorStarted {
            project_id: self.project_id.clone(),
            timestamp: Utc::now(),
        });

        let mut wave_id = 0u32;
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            let wave_tasks = self.queue.get_by_wave(wave_id);
            if wave_tasks.is_empty() && self.queue.size() == self.queue.completed_count() + self.queue.failed_count() {
                break;
            }
            if wave_tasks.is_empty() {
                wave_id += 1;
                if wave_id > 10_000 {
                    break;
                }
                continue;
            }

            self.emit(OrchestratorEvent::WaveStarted {
                project_id: self.project_id.clone(),
                wave_id,
                timestamp: Utc::now(),
            });

            self.process_wave(wave_id).await;

            if !self.stop_requested.load(Ordering::SeqCst) {
                self.emit(OrchestratorEvent::WaveCompleted {
                    project_id: self.project_id.clone(),
                    wave_id,
                    timestamp: Utc::now(),
                });
            }

            wave_id += 1;
            if self.queue.get_by_wave(wave_id).is_empty()
                && self.queue.completed_count() + self.queue.failed_count() >= self.queue.size()
            {
                break;
            }
        }

        *self.phase.write().await = Phase::Completion;
        let counters = self.counters.lock().await;
        let remaining = counters.total - counters.completed - counters.failed;
        if remaining == 0 && counters.completed > 0 {
            self.emit(OrchestratorEvent::ProjectCompleted {
                project_id: self.project_id.clone(),
                total_tasks: counters.total,
                completed_tasks: counters.completed,
                failed_tasks: counters.failed,
                timestamp: Utc::now(),
            });
        } else if counters.failed == counters.total && counters.total > 0 {
            self.emit(OrchestratorEvent::ProjectFailed {
                project_id: self.project_id.clone(),
                error: "all tasks failed".to_string(),
                timestamp: Utc::now(),
            });
        }
        drop(counters);

        *self.state.write().await = CoordinatorState::Idle;
        self.emit(OrchestratorEvent::CoordinatorStopped {
            project_id: self.project_id.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn process_wave(&self, wave_id: u32) {
        let mut running: HashMap<TaskId, tokio::task::JoinHandle<()>> = HashMap::new();

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if self.pause_requested.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(50)).await;
                continue;
            }

            let ready_count = self
                .queue
                .get_ready_tasks()
                .into_iter()
                .filter(|t| t.wave_id == wave_id)
                .count();

            if ready_count == 0 && running.is_empty() {
                break;
            }

            for _ in 0..ready_count {
                // Reuse an idle agent if one is sitting around; only a fresh
                // `spawn` is bound by `has_capacity` (an idle agent is
                // already counted against the cap, so reusing it needs no
                // capacity check of its own).
                let idle = self.pool.get_available_by_type(AgentType::Coder).await;
                let reused = idle.into_iter().next();
                if reused.is_none() && !self.pool.has_capacity(AgentType::Coder).await {
                    break;
                }
                // `dequeue` honours wave/priority/insertion order, so the
                // claim here is always for `wave_id` as long as `ready_count`
                // still reflects this wave (checked fresh each scan).
                let Some(claimed) = self.queue.dequeue() else {
                    break;
                };
                let agent = match reused {
                    Some(existing) => existing,
                    None => match self.pool.spawn(AgentType::Coder).await {
                        Ok(a) => a,
                        Err(_) => break,
                    },
                };

                let worktree = self.worktrees.create_worktree_internal(&claimed.id).await.ok();
                let worktree_path = worktree.as_ref().map(|w| w.path.clone());

                if self
                    .pool
                    .assign(&agent.id, &claimed.id, worktree_path.clone())
                    .await
                    .is_err()
                {
                    continue;
                }

                self.emit(OrchestratorEvent::TaskAssigned {
                    project_id: self.project_id.clone(),
                    task_id: claimed.id.clone(),
                    agent_id: agent.id.clone(),
                    timestamp: Utc::now(),
                });

                let handle = self.spawn_execute_task(claimed, agent.id, worktree_path);
                running.insert(handle.0, handle.1);
            }

            running.retain(|_, h| !h.is_finished());
            sleep(Duration::from_millis(50)).await;
        }

        for (_, handle) in running {
            let _ = handle.await;
        }
    }

    fn spawn_execute_task(
        &self,
        task: Task,
        agent_id: String,
        worktree_path: Option<String>,
    ) -> (TaskId, tokio::task::JoinHandle<()>) {
        let task_id = task.id.clone();
        // executeTask needs shared access to collaborators; Coordinator
        // itself isn't `'static` across a spawned task, so the relevant
        // state is cloned into an Arc-backed inner executor.
        let exec = ExecuteTaskCtx {
            project_id: self.project_id.clone(),
            settings: self.settings.clone(),
            queue: self.queue.clone(),
            pool: self.pool.clone(),
            worktrees: self.worktrees.clone(),
            events: self.events.clone(),
            reviewer: self.reviewer.clone(),
            review_service: self.review_service.clone(),
            qa_gates: self.qa_gates.clone(),
            counters: self.counters.clone(),
            pending_reviews: self.pending_reviews.clone(),
            state: self.state.clone(),
            pause_requested: self.pause_requested.clone(),
        };

        let handle = tokio::spawn(async move {
            exec.run(task, agent_id, worktree_path).await;
        });

        (task_id, handle)
    }

    pub async fn pause(&self, _reason: Option<String>) {
        self.pause_requested.store(true, Ordering::SeqCst);
        *self.state.write().await = CoordinatorState::Paused;
        self.emit(OrchestratorEvent::CoordinatorPaused {
            project_id: self.project_id.clone(),
            reason: _reason,
            timestamp: Utc::now(),
        });
    }

    pub async fn resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        *self.state.write().await = CoordinatorState::Running;
        self.emit(OrchestratorEvent::CoordinatorResumed {
            project_id: self.project_id.clone(),
            timestamp: Utc::now(),
        });
    }

    pub async fn stop(&self) {
        *self.state.write().await = CoordinatorState::Stopping;
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub async fn handle_review_approved(
        &self,
        review_id: &str,
        _resolution: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let review = self
            .pending_reviews
            .lock()
            .await
            .remove(review_id)
            .ok_or_else(|| CoordinatorError::UnknownReview(review_id.to_string()))?;

        self.queue.mark_complete(&review.task_id).ok();
        let mut counters = self.counters.lock().await;
        counters.completed += 1;
        drop(counters);

        self.emit(OrchestratorEvent::TaskCompleted {
            project_id: self.project_id.clone(),
            task_id: review.task_id.clone(),
            human_approved: true,
            timestamp: Utc::now(),
        });

        if let Some(path) = &review.worktree_path {
            let _ = path;
            self.worktrees.remove_worktree_internal(&review.task_id).await.ok();
        }
        self.pool.release(&review.agent_id).await;

        if review.resumed_pause {
            self.resume().await;
        }
        Ok(())
    }

    pub async fn handle_review_rejected(
        &self,
        review_id: &str,
        feedback: String,
    ) -> Result<(), CoordinatorError> {
        let review = self
            .pending_reviews
            .lock()
            .await
            .remove(review_id)
            .ok_or_else(|| CoordinatorError::UnknownReview(review_id.to_string()))?;

        self.queue.mark_failed(&review.task_id).ok();
        let mut counters = self.counters.lock().await;
        counters.failed += 1;
        drop(counters);

        self.emit(OrchestratorEvent::TaskFailed {
            project_id: self.project_id.clone(),
            task_id: review.task_id.clone(),
            human_rejected: true,
            feedback: Some(feedback),
            timestamp: Utc::now(),
        });

        self.worktrees.remove_worktree_internal(&review.task_id).await.ok();
        self.pool.release(&review.agent_id).await;

        if review.resumed_pause {
            self.resume().await;
        }
        Ok(())
    }

    pub async fn create_checkpoint(&self, _name: Option<String>) -> coordination::Checkpoint {
        let counters = self.counters.lock().await;
        coordination::Checkpoint {
            project_id: self.project_id.clone(),
            wave_id: self.queue.current_wave(),
            completed_task_ids: vec![],
            pending_task_ids: self.queue.get_ready_tasks().into_iter().map(|t| t.id).collect(),
            coordinator_state: format!("{:?}", *self.state.read().await),
            vcs_commit: None,
            created_at: Utc::now(),
        }
    }
}

/// Data `executeTask` needs, split out so it can be moved into a
/// detached `tokio::spawn` independent of `Coordinator`'s own lifetime.
struct ExecuteTaskCtx {
    project_id: String,
    settings: ProjectSettings,
    queue: Arc<TaskQueue>,
    pool: Arc<AgentPool>,
    worktrees: Arc<WorktreeManager>,
    events: Arc<EventBus>,
    reviewer: Option<Arc<dyn CodeReviewer>>,
    review_service: Option<Arc<dyn HumanReviewService>>,
    qa_gates: Option<Arc<QaGates>>,
    counters: Arc<Mutex<Counters>>,
    pending_reviews: Arc<Mutex<HashMap<String, EscalatedReview>>>,
    state: Arc<RwLock<CoordinatorState>>,
    pause_requested: Arc<AtomicBool>,
}

impl ExecuteTaskCtx {
    /// Pauses the coordinator on behalf of an escalation, unless it is
    /// already paused. Returns whether this call is the one that paused
    /// it, so the caller can remember to resume it later.
    async fn pause_for_review(&self) -> bool {
        let mut state = self.state.write().await;
        if *state == CoordinatorState::Paused {
            return false;
        }
        *state = CoordinatorState::Paused;
        drop(state);
        self.pause_requested.store(true, Ordering::SeqCst);
        self.emit(OrchestratorEvent::CoordinatorPaused {
            project_id: self.project_id.clone(),
            reason: Some("review_pending".to_string()),
            timestamp: Utc::now(),
        });
        true
    }

    async fn resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        *self.state.write().await = CoordinatorState::Running;
        self.emit(OrchestratorEvent::CoordinatorResumed {
            project_id: self.project_id.clone(),
            timestamp: Utc::now(),
        });
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.publish(event);
    }

    async fn run(&self, task: Task, agent_id: String, worktree_path: Option<String>) {
        self.emit(OrchestratorEvent::TaskStarted {
            project_id: self.project_id.clone(),
            task_id: task.id.clone(),
            timestamp: Utc::now(),
        });

        let ctx = RunnerContext {
            worktree_path: worktree_path.clone().unwrap_or_default(),
            ..RunnerContext::default()
        };

        let (outcome, _guard) = self.pool.run_task(&agent_id, &task, &ctx).await;

        match outcome {
            Ok(_) => self.run_qa_and_finish(task, agent_id, worktree_path).await,
            Err(_) => {
                self.fail_task(&task, &agent_id, worktree_path, "task execution failed".into())
                    .await;
            }
        }
    }

    /// Runs the build/lint/test/review gate sequence between the
    /// coder's pass and the merge step when gates, a reviewer, and a
    /// worktree are all bound; otherwise merges the coder's result
    /// straight through, same as a pool running only a coder.
    async fn run_qa_and_finish(&self, task: Task, agent_id: String, worktree_path: Option<String>) {
        let coder = self.pool.runner_for(AgentType::Coder);
        let (Some(gates), Some(reviewer), Some(path), Some(coder)) =
            (&self.qa_gates, &self.reviewer, &worktree_path, coder)
        else {
            self.finish_success(&task, &agent_id, worktree_path).await;
            return;
        };

        let outcome = qa_loop::run(
            gates.build.as_ref(),
            gates.lint.as_ref(),
            gates.test.as_ref(),
            reviewer.as_ref(),
            coder.as_ref(),
            &task,
            path.as_str(),
            self.settings.qa_max_iterations,
        )
        .await;

        match outcome {
            QaOutcome::Success { .. } => {
                self.finish_success(&task, &agent_id, worktree_path).await;
            }
            QaOutcome::Escalated { reason, .. } => {
                self.escalate_for_review(&task, &agent_id, &worktree_path, reason).await;
                self.release_resources(&agent_id, &task.id, worktree_path).await;
            }
        }
    }

    async fn finish_success(&self, task: &Task, agent_id: &str, worktree_path: Option<String>) {
        if let Some(path) = &worktree_path {
            let merge = self.worktrees.merge(path, "main").await;
            if merge.success {
                self.emit(OrchestratorEvent::TaskMerged {
                    project_id: self.project_id.clone(),
                    task_id: task.id.clone(),
                    commit_hash: merge.commit_hash.unwrap_or_default(),
                    timestamp: Utc::now(),
                });
            } else if !merge.conflict_files.is_empty() && self.review_service.is_some() {
                self.escalate_for_review(task, agent_id, worktree_path, "merge_conflict".into())
                    .await;
                self.release_resources(agent_id, &task.id, worktree_path.clone()).await;
                return;
            } else {
                self.emit(OrchestratorEvent::TaskMergeFailed {
                    project_id: self.project_id.clone(),
                    task_id: task.id.clone(),
                    error: merge.error.unwrap_or_default(),
                    timestamp: Utc::now(),
                });
                self.queue.mark_failed(&task.id).ok();
                self.counters.lock().await.failed += 1;
                self.release_resources(agent_id, &task.id, worktree_path).await;
                return;
            }
        }

        self.queue.mark_complete(&task.id).ok();
        self.counters.lock().await.completed += 1;

        self.emit(OrchestratorEvent::TaskCompleted {
            project_id: self.project_id.clone(),
            task_id: task.id.clone(),
            human_approved: false,
            timestamp: Utc::now(),
        });
        self.release_resources(agent_id, &task.id, worktree_path).await;
    }

    async fn fail_task(
        &self,
        task: &Task,
        agent_id: &str,
        worktree_path: Option<String>,
        _reason: String,
    ) {
        self.queue.mark_failed(&task.id).ok();
        self.counters.lock().await.failed += 1;

        self.emit(OrchestratorEvent::TaskFailed {
            project_id: self.project_id.clone(),
            task_id: task.id.clone(),
            human_rejected: false,
            feedback: None,
            timestamp: Utc::now(),
        });
        self.release_resources(agent_id, &task.id, worktree_path).await;
    }

    /// Opens a human review and records the task/agent/worktree mapping
    /// needed to resolve it later via `handle_review_approved/rejected`;
    /// deliberately does not mark the task complete or failed yet.
    async fn escalate_for_review(
        &self,
        task: &Task,
        agent_id: &str,
        worktree_path: &Option<String>,
        reason: String,
    ) {
        let review_id = if let Some(service) = &self.review_service {
            let id = service
                .request_review(ReviewRequestParams {
                    task_id: task.id.clone(),
                    project_id: self.project_id.clone(),
                    reason: reason.clone(),
                    context: Default::default(),
                })
                .await
                .unwrap_or_else(|_| Uuid::new_v4().to_string());

            self.emit(OrchestratorEvent::ReviewRequested {
                project_id: self.project_id.clone(),
                review_id: id.clone(),
                task_id: task.id.clone(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
            Some(id)
        } else {
            None
        };

        if let Some(id) = &review_id {
            let resumed_pause = self.pause_for_review().await;
            self.pending_reviews.lock().await.insert(
                id.clone(),
                EscalatedReview {
                    task_id: task.id.clone(),
                    agent_id: agent_id.to_string(),
                    worktree_path: worktree_path.clone(),
                    resumed_pause,
                },
            );
        }

        self.emit(OrchestratorEvent::TaskEscalated {
            project_id: self.project_id.clone(),
            task_id: task.id.clone(),
            reason,
            review_id,
            timestamp: Utc::now(),
        });

        let _ = self.settings.qa_max_iterations;
    }

    async fn release_resources(&self, agent_id: &str, task_id: &str, worktree_path: Option<String>) {
        if let Some(_path) = worktree_path {
            let _ = self.worktrees.remove_worktree_internal(task_id).await;
        }
        self.pool.release(agent_id).await;
        self.emit(OrchestratorEvent::AgentReleased {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn calculate_waves(tasks: &mut [Task]) {
    let mut resolved: HashMap<TaskId, u32> = HashMap::new();
    let ids: std::collections::HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
    let mut remaining: Vec<usize> = (0..tasks.len()).collect();

    let mut guard = 0;
    while !remaining.is_empty() && guard < tasks.len() + 1 {
        guard += 1;
        let mut progressed = Vec::new();
        for &i in &remaining {
            let deps = &tasks[i].depends_on;
            if deps.iter().all(|d| !ids.contains(d) || resolved.contains_key(d)) {
                let wave = deps
                    .iter()
                    .filter_map(|d| resolved.get(d))
                    .max()
                    .map(|w| w + 1)
                    .unwrap_or(0);
                resolved.insert(tasks[i].id.clone(), wave);
                progressed.push(i);
            }
        }
        remaining.retain(|i| !progressed.contains(i));
        if progressed.is_empty() {
            break;
        }
    }

    for t in tasks.iter_mut() {
        t.wave_id = *resolved.get(&t.id).unwrap_or(&0);
    }
}

/// Placeholder implementation of `Wave` grouping from the queue, kept
/// for callers that want the explicit struct rather than a filtered
/// task list.
pub fn waves_from_tasks(tasks: &[Task]) -> Vec<Wave> {
    let mut by_wave: HashMap<u32, Vec<TaskId>> = HashMap::new();
    for t in tasks {
        by_wave.entry(t.wave_id).or_default().push(t.id.clone());
    }
    let mut waves: Vec<Wave> = by_wave
        .into_iter()
        .map(|(id, task_ids)| Wave { id, task_ids })
        .collect();
    waves.sort_by_key(|w| w.id);
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::contracts::PlanningTask;
    use coordination::domain::TaskStatus as TS;
    use coordination::EventBus;
    use std::collections::HashMap as Map;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            files: vec![],
            test_criteria: vec![],
            estimated_minutes: 5,
            priority: 0,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            wave_id: 0,
            status: TS::Pending,
        }
    }

    #[test]
    fn calculate_waves_orders_by_dependency_depth() {
        let mut tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        calculate_waves(&mut tasks);
        let by_id: Map<&str, u32> = tasks.iter().map(|t| (t.id.as_str(), t.wave_id)).collect();
        assert_eq!(by_id["a"], 0);
        assert_eq!(by_id["b"], 1);
        assert_eq!(by_id["c"], 2);
    }

    #[tokio::test]
    async fn new_coordinator_starts_idle() {
        let config = ProjectConfig::default();
        let pool = Arc::new(AgentPool::new(Map::new(), Map::new(), None));
        let wt = Arc::new(WorktreeManager::new("/tmp", "/tmp"));
        let events = Arc::new(EventBus::new());
        let coordinator = Coordinator::new(config, pool, wt, events, None, None, None, None);
        assert_eq!(coordinator.status().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_state() {
        let config = ProjectConfig::default();
        let pool = Arc::new(AgentPool::new(Map::new(), Map::new(), None));
        let wt = Arc::new(WorktreeManager::new("/tmp", "/tmp"));
        let events = Arc::new(EventBus::new());
        let coordinator = Coordinator::new(config, pool, wt, events, None, None, None, None);

        coordinator.pause(Some("manual".into())).await;
        assert_eq!(coordinator.status().await, CoordinatorState::Paused);
        coordinator.resume().await;
        assert_eq!(coordinator.status().await, CoordinatorState::Running);
    }

    #[tokio::test]
    async fn unknown_review_id_is_rejected() {
        let config = ProjectConfig::default();
        let pool = Arc::new(AgentPool::new(Map::new(), Map::new(), None));
        let wt = Arc::new(WorktreeManager::new("/tmp", "/tmp"));
        let events = Arc::new(EventBus::new());
        let coordinator = Coordinator::new(config, pool, wt, events, None, None, None, None);
        let err = coordinator
            .handle_review_approved("does-not-exist", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownReview(_)));
    }

    struct StubDecomposer;

    #[async_trait::async_trait]
    impl TaskDecomposer for StubDecomposer {
        async fn decompose(&self, _description: &str) -> Result<Vec<PlanningTask>, String> {
            Ok(vec![PlanningTask {
                name: "t1".into(),
                description: "do a thing".into(),
                files: vec![],
                test_criteria: vec![],
                estimated_minutes: 5,
                depends_on: vec![],
            }])
        }
    }

    /// No runner is registered for `Coder`, so the spawned task fails
    /// immediately — exercises the full start -> wave loop -> failure ->
    /// project:failed path without any real agent backend.
    #[tokio::test]
    async fn start_with_no_bound_runner_fails_the_task_and_completes() {
        let config = ProjectConfig {
            project_id: "p1".into(),
            ..ProjectConfig::default()
        };
        let pool = Arc::new(AgentPool::new(Map::new(), Map::new(), None));
        let wt = Arc::new(WorktreeManager::new("/tmp", "/tmp"));
        let events = Arc::new(EventBus::new());
        let coordinator = Coordinator::new(
            config,
            pool,
            wt,
            events,
            Some(Arc::new(StubDecomposer)),
            None,
            None,
            None,
        );

        coordinator.start(vec!["feature one".into()]).await.unwrap();

        let progress = coordinator.progress().await;
        assert_eq!(progress.total_tasks, 1);
        assert_eq!(progress.failed_tasks, 1);
        assert_eq!(coordinator.status().await, CoordinatorState::Idle);
    }

    struct AlwaysPassGate;

    #[async_trait::async_trait]
    impl BuildVerifier for AlwaysPassGate {
        async fn verify(&self, _worktree_path: &str) -> coordination::contracts::VerifyResult {
            coordination::contracts::VerifyResult { success: true, ..Default::default() }
        }
    }

    #[async_trait::async_trait]
    impl LintRunner for AlwaysPassGate {
        async fn lint(&self, _worktree_path: &str) -> coordination::contracts::VerifyResult {
            coordination::contracts::VerifyResult { success: true, ..Default::default() }
        }
    }

    #[async_trait::async_trait]
    impl TestRunner for AlwaysPassGate {
        async fn run_tests(
            &self,
            _worktree_path: &str,
            _criteria: &[String],
        ) -> coordination::contracts::TestResult {
            coordination::contracts::TestResult {
                success: true,
                passed: 1,
                failed: 0,
                skipped: 0,
                failures: vec![],
                duration_ms: 1,
            }
        }
    }

    #[async_trait::async_trait]
    impl CodeReviewer for AlwaysPassGate {
        async fn review(&self, _worktree_path: &str, _task: &Task) -> coordination::contracts::ReviewResult {
            coordination::contracts::ReviewResult {
                approved: true,
                has_blocking_issues: false,
                issues: vec![],
                summary: "fine".into(),
            }
        }
    }

    struct AlwaysSucceedCoder;

    #[async_trait::async_trait]
    impl crate::runners::AgentRunner for AlwaysSucceedCoder {
        async fn execute(
            &self,
            task: &Task,
            _ctx: &RunnerContext,
        ) -> Result<crate::runners::TaskResult, crate::runners::RunnerError> {
            Ok(crate::runners::TaskResult {
                task_id: task.id.clone(),
                success: true,
                output: String::new(),
                files_modified: vec![],
                metrics: crate::runners::TaskMetrics::default(),
            })
        }

        async fn fix_issues(
            &self,
            _errors: &[coordination::domain::StageError],
        ) -> Result<crate::runners::TaskResult, crate::runners::RunnerError> {
            unreachable!("gates always pass in this test")
        }
    }

    /// A bound QA-gate trio plus a reviewer drives the task through
    /// `qa_loop::run` before marking it complete, instead of trusting
    /// the coder's own `execute` result directly.
    #[tokio::test]
    async fn start_with_qa_gates_runs_the_gate_sequence_before_completing() {
        let config = ProjectConfig {
            project_id: "p2".into(),
            ..ProjectConfig::default()
        };
        let mut runners: Map<AgentType, Arc<dyn crate::runners::AgentRunner>> = Map::new();
        runners.insert(AgentType::Coder, Arc::new(AlwaysSucceedCoder));
        let pool = Arc::new(AgentPool::new(runners, Map::new(), None));
        let wt = Arc::new(WorktreeManager::new("/tmp", "/tmp"));
        let events = Arc::new(EventBus::new());
        let gates = Arc::new(QaGates {
            build: Arc::new(AlwaysPassGate),
            lint: Arc::new(AlwaysPassGate),
            test: Arc::new(AlwaysPassGate),
        });
        let coordinator = Coordinator::new(
            config,
            pool,
            wt,
            events,
            Some(Arc::new(StubDecomposer)),
            Some(Arc::new(AlwaysPassGate)),
            None,
            Some(gates),
        );

        coordinator.start(vec!["feature one".into()]).await.unwrap();

        let progress = coordinator.progress().await;
        assert_eq!(progress.total_tasks, 1);
        assert_eq!(progress.completed_tasks, 1);
        assert_eq!(progress.failed_tasks, 0);
    }

    struct AlwaysFailGate;

    #[async_trait::async_trait]
    impl BuildVerifier for AlwaysFailGate {
        async fn verify(&self, _worktree_path: &str) -> coordination::contracts::VerifyResult {
            coordination::contracts::VerifyResult {
                success: false,
                errors: vec![coordination::domain::StageError {
                    file: None,
                    line: None,
                    message: "build failed".into(),
                    severity: Some("error".into()),
                }],
                warnings: vec![],
                duration_ms: 1,
            }
        }
    }

    struct StubReviewService;

    #[async_trait::async_trait]
    impl HumanReviewService for StubReviewService {
        async fn request_review(
            &self,
            _params: ReviewRequestParams,
        ) -> Result<String, String> {
            Ok("review-1".to_string())
        }
    }

    /// Succeeds its own turn and its repairs, so a permanently failing
    /// gate drives the QA loop to exhaustion instead of a coder error.
    struct RetryingCoder;

    #[async_trait::async_trait]
    impl crate::runners::AgentRunner for RetryingCoder {
        async fn execute(
            &self,
            task: &Task,
            _ctx: &RunnerContext,
        ) -> Result<crate::runners::TaskResult, crate::runners::RunnerError> {
            Ok(crate::runners::TaskResult {
                task_id: task.id.clone(),
                success: true,
                output: String::new(),
                files_modified: vec![],
                metrics: crate::runners::TaskMetrics::default(),
            })
        }

        async fn fix_issues(
            &self,
            _errors: &[coordination::domain::StageError],
        ) -> Result<crate::runners::TaskResult, crate::runners::RunnerError> {
            Ok(crate::runners::TaskResult {
                task_id: "retry".into(),
                success: true,
                output: String::new(),
                files_modified: vec![],
                metrics: crate::runners::TaskMetrics::default(),
            })
        }
    }

    #[tokio::test]
    async fn escalation_pauses_and_approval_resumes() {
        let config = ProjectConfig {
            project_id: "p3".into(),
            settings: ProjectSettings {
                qa_max_iterations: 1,
                ..ProjectSettings::default()
            },
            ..ProjectConfig::default()
        };
        let mut runners: Map<AgentType, Arc<dyn crate::runners::AgentRunner>> = Map::new();
        runners.insert(AgentType::Coder, Arc::new(RetryingCoder));
        let pool = Arc::new(AgentPool::new(runners, Map::new(), None));
        let wt = Arc::new(WorktreeManager::new("/tmp", "/tmp"));
        let events = Arc::new(EventBus::new());
        let gates = Arc::new(QaGates {
            build: Arc::new(AlwaysFailGate),
            lint: Arc::new(AlwaysPassGate),
            test: Arc::new(AlwaysPassGate),
        });
        let coordinator = Arc::new(Coordinator::new(
            config,
            pool,
            wt,
            events,
            Some(Arc::new(StubDecomposer)),
            Some(Arc::new(AlwaysPassGate)),
            Some(Arc::new(StubReviewService)),
            Some(gates),
        ));

        let mut rx = coordinator.subscribe();
        let driver = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator.start(vec!["feature one".into()]).await.unwrap();
            })
        };

        loop {
            match rx.recv().await.unwrap() {
                OrchestratorEvent::CoordinatorPaused { reason, .. } => {
                    assert_eq!(reason.as_deref(), Some("review_pending"));
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(coordinator.status().await, CoordinatorState::Paused);

        coordinator
            .handle_review_approved("review-1", None)
            .await
            .unwrap();

        loop {
            match rx.recv().await.unwrap() {
                OrchestratorEvent::CoordinatorResumed { .. } => break,
                _ => continue,
            }
        }

        driver.await.unwrap();
    }
}
