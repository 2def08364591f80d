//! Merge runner: folds a completed task's worktree branch into the
//! target branch via the `VcsWorktree` capability, translating the raw
//! merge-conflict signal into a `TaskResult` rather than retrying —
//! merge conflicts are the worktree manager's concern to surface, not
//! this runner's to resolve.

use std::sync::Arc;

use async_trait::async_trait;
use coordination::contracts::VcsWorktree;
use coordination::domain::{StageError, Task};

use super::{AgentRunner, RunnerContext, RunnerError, TaskMetrics, TaskResult};

pub struct MergerRunner {
    vcs: Arc<dyn VcsWorktree>,
    target_branch: String,
}

impl MergerRunner {
    pub fn new(vcs: Arc<dyn VcsWorktree>, target_branch: impl Into<String>) -> Self {
        Self {
            vcs,
            target_branch: target_branch.into(),
        }
    }
}

#[async_trait]
impl AgentRunner for MergerRunner {
    async fn execute(&self, task: &Task, ctx: &RunnerContext) -> Result<TaskResult, RunnerError> {
        let result = self
            .vcs
            .merge(&ctx.worktree_path, &self.target_branch)
            .await;

        let output = if result.success {
            result
                .commit_hash
                .clone()
                .unwrap_or_else(|| "merged".to_string())
        } else if !result.conflict_files.is_empty() {
            format!("conflict in: {}", result.conflict_files.join(", "))
        } else {
            result.error.clone().unwrap_or_else(|| "merge failed".into())
        };

        Ok(TaskResult {
            task_id: task.id.clone(),
            success: result.success,
            output,
            files_modified: result.conflict_files,
            metrics: TaskMetrics::default(),
        })
    }

    /// Merging has nothing to "fix" — a conflicted merge goes back to a
    /// coder task, not through this runner again.
    async fn fix_issues(&self, _errors: &[StageError]) -> Result<TaskResult, RunnerError> {
        Err(RunnerError::NoRunner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::contracts::{MergeResult, PushResult, WorktreeHandle};
    use coordination::domain::TaskStatus;

    struct StubVcs {
        result: MergeResult,
    }

    #[async_trait]
    impl VcsWorktree for StubVcs {
        async fn create_worktree(&self, _task_id: &String) -> Result<WorktreeHandle, String> {
            unimplemented!()
        }
        async fn remove_worktree(&self, _task_id: &String) -> Result<(), String> {
            unimplemented!()
        }
        async fn get_worktree(&self, _task_id: &String) -> Option<WorktreeHandle> {
            None
        }
        async fn list_worktrees(&self) -> Vec<WorktreeHandle> {
            vec![]
        }
        async fn merge(&self, _source_path: &str, _target_branch: &str) -> MergeResult {
            self.result.clone()
        }
        async fn push_to_remote(&self, _branch: &str) -> PushResult {
            PushResult {
                success: true,
                error: None,
            }
        }
    }

    fn sample_task() -> Task {
        Task {
            id: "t1".into(),
            name: "n".into(),
            description: String::new(),
            files: vec![],
            test_criteria: vec![],
            estimated_minutes: 0,
            priority: 0,
            depends_on: vec![],
            wave_id: 0,
            status: TaskStatus::Assigned,
        }
    }

    #[tokio::test]
    async fn reports_conflict_files_without_erroring() {
        let vcs = Arc::new(StubVcs {
            result: MergeResult {
                success: false,
                commit_hash: None,
                error: None,
                conflict_files: vec!["src/lib.rs".into()],
            },
        });
        let runner = MergerRunner::new(vcs, "main");
        let result = runner
            .execute(&sample_task(), &RunnerContext::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.files_modified, vec!["src/lib.rs".to_string()]);
    }

    #[tokio::test]
    async fn reports_success_with_commit_hash() {
        let vcs = Arc::new(StubVcs {
            result: MergeResult {
                success: true,
                commit_hash: Some("abc123".into()),
                error: None,
                conflict_files: vec![],
            },
        });
        let runner = MergerRunner::new(vcs, "main");
        let result = runner
            .execute(&sample_task(), &RunnerContext::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "abc123");
    }
}
