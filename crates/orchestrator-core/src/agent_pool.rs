//! Bounded, role-specialised worker pool.
//!
//! `run_task`'s release-on-every-exit-path requirement (success, failure,
//! panic) is expressed with an RAII guard rather than a `finally` block —
//! the idiomatic substitute, following the same drop-for-cleanup shape
//! the teacher uses for session-state flushing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use coordination::{Agent, AgentId, AgentMetrics, AgentStatus, AgentType, EventBus, PoolError};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::runners::{AgentRunner, RunnerContext, RunnerError, TaskResult};

struct PoolState {
    agents: HashMap<AgentId, Agent>,
    capacity: HashMap<AgentType, u32>,
}

pub struct AgentPool {
    state: Mutex<PoolState>,
    runners: HashMap<AgentType, Arc<dyn AgentRunner>>,
    events: Option<Arc<EventBus>>,
}

/// Per-role snapshot: how many agents of a type are idle/active against
/// its configured capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTypeStatus {
    pub agent_type: AgentType,
    pub idle: usize,
    pub active: usize,
    pub capacity: usize,
}

/// Aggregate pool snapshot, one entry per role that has ever spawned an
/// agent or has a configured capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub by_type: Vec<AgentTypeStatus>,
}

/// Releases its bound agent back to `idle` on drop, regardless of how
/// the caller's scope exits — the Rust substitute for a `finally` block.
pub struct AgentReleaseGuard<'a> {
    pool: &'a AgentPool,
    agent_id: AgentId,
    released: bool,
}

impl<'a> AgentReleaseGuard<'a> {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn release_now(mut self) {
        self.pool.release(&self.agent_id).await;
        self.released = true;
    }
}

impl Drop for AgentReleaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool_agents = self.pool.state.blocking_lock_release(&self.agent_id);
        drop(pool_agents);
    }
}

impl PoolState {
    fn default_capacity() -> HashMap<AgentType, u32> {
        let mut caps = HashMap::new();
        caps.insert(AgentType::Coder, 4);
        caps.insert(AgentType::Tester, 2);
        caps.insert(AgentType::Reviewer, 2);
        caps.insert(AgentType::Merger, 1);
        caps.insert(AgentType::Planner, 1);
        caps
    }
}

/// Small helper so `Drop` (sync context) can still flip agent state back
/// to idle without requiring an async runtime inside `drop`.
trait BlockingRelease {
    fn blocking_lock_release(&self, agent_id: &str);
}

impl BlockingRelease for Mutex<PoolState> {
    fn blocking_lock_release(&self, agent_id: &str) {
        if let Ok(mut guard) = self.try_lock() {
            if let Some(agent) = guard.agents.get_mut(agent_id) {
                agent.status = AgentStatus::Idle;
                agent.current_task_id = None;
                agent.worktree_path = None;
                agent.last_active_at = Utc::now();
            }
        }
    }
}

impl AgentPool {
    pub fn new(
        runners: HashMap<AgentType, Arc<dyn AgentRunner>>,
        capacity: HashMap<AgentType, u32>,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        let mut caps = PoolState::default_capacity();
        caps.extend(capacity);
        Self {
            state: Mutex::new(PoolState {
                agents: HashMap::new(),
                capacity: caps,
            }),
            runners,
            events,
        }
    }

    fn emit(&self, event: coordination::OrchestratorEvent) {
        if let Some(bus) = &self.events {
            let _ = bus.publish(event);
        }
    }

    pub async fn spawn(&self, agent_type: AgentType) -> Result<Agent, PoolError> {
        let mut state = self.state.lock().await;
        let cap = *state.capacity.get(&agent_type).unwrap_or(&1) as usize;
        let active = state
            .agents
            .values()
            .filter(|a| a.agent_type == agent_type && a.status != AgentStatus::Terminated)
            .count();
        if active >= cap {
            return Err(PoolError::AtCapacity(agent_type, active));
        }
        let id = Uuid::new_v4().to_string();
        let agent = Agent::new(id.clone(), agent_type);
        state.agents.insert(id.clone(), agent.clone());
        drop(state);
        info!(agent_id = %id, agent_type = ?agent_type, "agent spawned");
        self.emit(coordination::OrchestratorEvent::AgentSpawned {
            agent_id: id,
            agent_type: agent_type.as_str().to_string(),
            timestamp: Utc::now(),
        });
        Ok(agent)
    }

    pub async fn terminate(&self, id: &str) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| PoolError::AgentNotFound(id.to_string()))?;
        agent.status = AgentStatus::Terminated;
        let metrics = agent.metrics.clone();
        drop(state);
        self.emit(coordination::OrchestratorEvent::AgentTerminated {
            agent_id: id.to_string(),
            reason: coordination::events::TerminationReason::Shutdown,
            tasks_completed: metrics.tasks_completed,
            tasks_failed: metrics.tasks_failed,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub async fn assign(
        &self,
        id: &str,
        task_id: &str,
        worktree_path: Option<String>,
    ) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| PoolError::AgentNotFound(id.to_string()))?;
        if agent.status != AgentStatus::Idle {
            return Err(PoolError::AgentNotIdle(id.to_string()));
        }
        agent.status = AgentStatus::Assigned;
        agent.current_task_id = Some(task_id.to_string());
        agent.worktree_path = worktree_path;
        Ok(())
    }

    pub async fn release(&self, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(agent) = state.agents.get_mut(id) {
            agent.status = AgentStatus::Idle;
            agent.current_task_id = None;
            agent.worktree_path = None;
            agent.last_active_at = Utc::now();
        }
        drop(state);
        self.emit(coordination::OrchestratorEvent::AgentIdle {
            agent_id: id.to_string(),
            idle_since: Utc::now(),
        });
    }

    /// Executes the task via the role's runner end-to-end. The returned
    /// guard releases the agent back to idle on drop even if this
    /// future is cancelled or the caller never calls `release_now`.
    pub async fn run_task<'a>(
        &'a self,
        agent_id: &str,
        task: &coordination::Task,
        ctx: &RunnerContext,
    ) -> (Result<TaskResult, RunnerError>, AgentReleaseGuard<'a>) {
        let guard = AgentReleaseGuard {
            pool: self,
            agent_id: agent_id.to_string(),
            released: false,
        };

        {
            let mut state = self.state.lock().await;
            if let Some(agent) = state.agents.get_mut(agent_id) {
                agent.status = AgentStatus::Working;
            }
        }

        let agent_type = {
            let state = self.state.lock().await;
            state.agents.get(agent_id).map(|a| a.agent_type)
        };

        let Some(agent_type) = agent_type else {
            return (Err(RunnerError::NoRunner), guard);
        };

        let runner = self.runners.get(&agent_type).cloned();
        let outcome = match runner {
            Some(r) => r.execute(task, ctx).await,
            None => Err(RunnerError::NoRunner),
        };

        let mut state = self.state.lock().await;
        if let Some(agent) = state.agents.get_mut(agent_id) {
            match &outcome {
                Ok(result) => {
                    agent.metrics.tasks_completed += 1;
                    agent.metrics.qa_iterations_total += result.metrics.iterations;
                    agent.metrics.tokens_consumed += result.metrics.tokens_used as u64;
                }
                Err(_) => {
                    agent.metrics.tasks_failed += 1;
                }
            }
        }
        drop(state);

        if outcome.is_err() {
            self.emit(coordination::OrchestratorEvent::AgentError {
                agent_id: agent_id.to_string(),
                error: format!("{:?}", outcome.as_ref().err()),
                recoverable: true,
                timestamp: Utc::now(),
            });
            warn!(agent_id, "agent task execution failed");
        }

        (outcome, guard)
    }

    /// Exposes the runner bound to a role, so a caller driving a
    /// multi-turn protocol on top of a single `execute` call (the QA
    /// repair loop's `fix_issues` retries) can hold onto the same
    /// instance rather than going through `run_task` again.
    pub fn runner_for(&self, agent_type: AgentType) -> Option<Arc<dyn AgentRunner>> {
        self.runners.get(&agent_type).cloned()
    }

    pub async fn get_all(&self) -> Vec<Agent> {
        self.state.lock().await.agents.values().cloned().collect()
    }

    pub async fn get_available_by_type(&self, agent_type: AgentType) -> Vec<Agent> {
        self.state
            .lock()
            .await
            .agents
            .values()
            .filter(|a| a.agent_type == agent_type && a.status == AgentStatus::Idle)
            .cloned()
            .collect()
    }

    pub async fn get_available(&self) -> Vec<Agent> {
        self.state
            .lock()
            .await
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle)
            .cloned()
            .collect()
    }

    /// Agents neither idle nor terminated — spawned/assigned/working.
    pub async fn get_active(&self) -> Vec<Agent> {
        self.state
            .lock()
            .await
            .agents
            .values()
            .filter(|a| a.status != AgentStatus::Idle && a.status != AgentStatus::Terminated)
            .cloned()
            .collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Agent> {
        self.state.lock().await.agents.get(id).cloned()
    }

    pub async fn has_capacity(&self, agent_type: AgentType) -> bool {
        let state = self.state.lock().await;
        let cap = *state.capacity.get(&agent_type).unwrap_or(&1) as usize;
        let active = state
            .agents
            .values()
            .filter(|a| a.agent_type == agent_type && a.status != AgentStatus::Terminated)
            .count();
        active < cap
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.agents.len()
    }

    pub async fn get_aggregated_metrics(&self) -> AgentMetrics {
        let state = self.state.lock().await;
        state
            .agents
            .values()
            .fold(AgentMetrics::default(), |mut acc, a| {
                acc.tasks_completed += a.metrics.tasks_completed;
                acc.tasks_failed += a.metrics.tasks_failed;
                acc.qa_iterations_total += a.metrics.qa_iterations_total;
                acc.tokens_consumed += a.metrics.tokens_consumed;
                acc.wall_time_active_ms += a.metrics.wall_time_active_ms;
                acc
            })
    }

    pub async fn get_pool_status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let mut types: Vec<AgentType> = state.capacity.keys().copied().collect();
        for a in state.agents.values() {
            if !types.contains(&a.agent_type) {
                types.push(a.agent_type);
            }
        }
        types.sort_by_key(|t| t.as_str());

        let by_type = types
            .into_iter()
            .map(|agent_type| {
                let idle = state
                    .agents
                    .values()
                    .filter(|a| a.agent_type == agent_type && a.status == AgentStatus::Idle)
                    .count();
                let active = state
                    .agents
                    .values()
                    .filter(|a| {
                        a.agent_type == agent_type
                            && a.status != AgentStatus::Idle
                            && a.status != AgentStatus::Terminated
                    })
                    .count();
                let capacity = *state.capacity.get(&agent_type).unwrap_or(&1) as usize;
                AgentTypeStatus {
                    agent_type,
                    idle,
                    active,
                    capacity,
                }
            })
            .collect();

        PoolStatus { by_type }
    }

    pub async fn terminate_all(&self) {
        let mut state = self.state.lock().await;
        for agent in state.agents.values_mut() {
            agent.status = AgentStatus::Terminated;
        }
    }
}
