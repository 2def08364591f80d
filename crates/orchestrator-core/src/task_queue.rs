//! Wave/priority/dependency-aware task queue.
//!
//! State lives behind a plain `std::sync::Mutex` rather than an async
//! lock — no `.await` ever happens while the lock is held, matching how
//! `coordination`'s escalation state kept its critical sections
//! synchronous-only.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use coordination::{QueueError, Task, TaskId, TaskStatus, WaveId};

struct Entry {
    task: Task,
    created_at: DateTime<Utc>,
}

struct Inner {
    entries: HashMap<TaskId, Entry>,
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    current_wave: WaveId,
}

/// Maintains the set of queued tasks and releases them in wave, then
/// priority, then insertion, then id order.
pub struct TaskQueue {
    inner: Mutex<Inner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                completed: HashSet::new(),
                failed: HashSet::new(),
                current_wave: 0,
            }),
        }
    }

    /// Insert a task, marking it `queued`. Fails on duplicate id.
    pub fn enqueue(&self, mut task: Task, wave_id: Option<WaveId>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&task.id) {
            return Err(QueueError::DuplicateTask(task.id));
        }
        if let Some(w) = wave_id {
            task.wave_id = w;
        }
        task.status = TaskStatus::Queued;
        inner.entries.insert(
            task.id.clone(),
            Entry {
                task,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Select the highest-priority ready task, mark it `assigned`, and
    /// remove it from the ready set (it stays tracked until
    /// `mark_complete`/`mark_failed`).
    pub fn dequeue(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::select_ready(&inner)?;
        let entry = inner.entries.get_mut(&id).unwrap();
        entry.task.status = TaskStatus::Assigned;
        Some(entry.task.clone())
    }

    /// Same selection as `dequeue` without mutation.
    pub fn peek(&self) -> Option<Task> {
        let inner = self.inner.lock().unwrap();
        Self::select_ready(&inner).map(|id| inner.entries[&id].task.clone())
    }

    fn select_ready(inner: &Inner) -> Option<TaskId> {
        let mut candidates: Vec<&Entry> = inner
            .entries
            .values()
            .filter(|e| {
                e.task.status == TaskStatus::Queued
                    && e.task.wave_id <= inner.current_wave
                    && e.task
                        .depends_on
                        .iter()
                        .all(|d| inner.completed.contains(d))
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.task
                .wave_id
                .cmp(&b.task.wave_id)
                .then(a.task.priority.cmp(&b.task.priority))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.task.id.cmp(&b.task.id))
        });

        candidates.first().map(|e| e.task.id.clone())
    }

    pub fn mark_complete(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(id) {
            return Err(QueueError::UnknownTask(id.to_string()));
        }
        inner.entries.get_mut(id).unwrap().task.status = TaskStatus::Completed;
        inner.completed.insert(id.to_string());
        self.advance_wave(&mut inner);
        Ok(())
    }

    /// Dependents are not unblocked; they remain blocked forever.
    pub fn mark_failed(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(id) {
            return Err(QueueError::UnknownTask(id.to_string()));
        }
        inner.entries.get_mut(id).unwrap().task.status = TaskStatus::Failed;
        inner.failed.insert(id.to_string());
        self.advance_wave(&mut inner);
        Ok(())
    }

    fn advance_wave(&self, inner: &mut Inner) {
        let has_current = inner
            .entries
            .values()
            .any(|e| e.task.wave_id == inner.current_wave && Self::is_open(&e.task.status));
        if has_current {
            return;
        }
        if let Some(next) = inner
            .entries
            .values()
            .map(|e| e.task.wave_id)
            .filter(|w| *w > inner.current_wave)
            .min()
        {
            inner.current_wave = next;
        }
    }

    fn is_open(status: &TaskStatus) -> bool {
        matches!(
            status,
            TaskStatus::Pending
                | TaskStatus::Queued
                | TaskStatus::Assigned
                | TaskStatus::Working
                | TaskStatus::Escalated
        )
    }

    pub fn get_ready_tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut ready: Vec<Task> = inner
            .entries
            .values()
            .filter(|e| {
                e.task.status == TaskStatus::Queued
                    && e.task.wave_id <= inner.current_wave
                    && e.task
                        .depends_on
                        .iter()
                        .all(|d| inner.completed.contains(d))
            })
            .map(|e| e.task.clone())
            .collect();
        ready.sort_by(|a, b| {
            a.wave_id
                .cmp(&b.wave_id)
                .then(a.priority.cmp(&b.priority))
                .then(a.id.cmp(&b.id))
        });
        ready
    }

    pub fn get_by_wave(&self, wave_id: WaveId) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .filter(|e| e.task.wave_id == wave_id)
            .map(|e| e.task.clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().unwrap().completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.inner.lock().unwrap().failed.len()
    }

    pub fn current_wave(&self) -> WaveId {
        self.inner.lock().unwrap().current_wave
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.completed.clear();
        inner.failed.clear();
        inner.current_wave = 0;
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, wave: u32, priority: i32, deps: &[&str]) -> Task {
        Task {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            files: vec![],
            test_criteria: vec![],
            estimated_minutes: 5,
            priority,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            wave_id: wave,
            status: TaskStatus::Pending,
        }
    }

    #[test]
    fn dequeue_respects_priority_within_wave() {
        let q = TaskQueue::new();
        q.enqueue(task("low", 0, 5, &[]), None).unwrap();
        q.enqueue(task("high", 0, 1, &[]), None).unwrap();
        let first = q.dequeue().unwrap();
        assert_eq!(first.id, "high");
    }

    #[test]
    fn dequeue_blocked_by_unmet_dependency() {
        let q = TaskQueue::new();
        q.enqueue(task("t1", 0, 0, &[]), None).unwrap();
        q.enqueue(task("t2", 0, 0, &["t1"]), None).unwrap();

        let first = q.dequeue().unwrap();
        assert_eq!(first.id, "t1");
        assert!(q.dequeue().is_none());

        q.mark_complete("t1").unwrap();
        let second = q.dequeue().unwrap();
        assert_eq!(second.id, "t2");
    }

    #[test]
    fn duplicate_enqueue_fails() {
        let q = TaskQueue::new();
        q.enqueue(task("t1", 0, 0, &[]), None).unwrap();
        assert!(q.enqueue(task("t1", 0, 0, &[]), None).is_err());
    }

    #[test]
    fn wave_advances_once_wave_is_drained() {
        let q = TaskQueue::new();
        q.enqueue(task("a", 0, 0, &[]), None).unwrap();
        q.enqueue(task("b", 1, 0, &[]), None).unwrap();

        assert_eq!(q.current_wave(), 0);
        assert!(q.dequeue().is_some()); // a
        assert!(q.dequeue().is_none()); // b is in wave 1, not visible yet
        q.mark_complete("a").unwrap();
        assert_eq!(q.current_wave(), 1);
        let next = q.dequeue().unwrap();
        assert_eq!(next.id, "b");
    }

    #[test]
    fn failed_dependency_blocks_dependents_forever() {
        let q = TaskQueue::new();
        q.enqueue(task("t1", 0, 0, &[]), None).unwrap();
        q.enqueue(task("t2", 0, 0, &["t1"]), None).unwrap();

        q.dequeue().unwrap();
        q.mark_failed("t1").unwrap();
        assert!(q.dequeue().is_none());
    }
}
