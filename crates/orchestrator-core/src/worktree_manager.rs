//! Per-task git worktree isolation and merge-back.
//!
//! Grounded on the teacher's `worktree_bridge.rs`: raw `git` subprocess
//! calls, no git library crate. Extended per the conflict-surfacing
//! requirement the teacher's source never needed — a failed `--no-ff`
//! merge is diffed for conflict markers and aborted instead of bailing
//! with raw stderr.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use coordination::contracts::{MergeResult, PushResult, VcsWorktree, WorktreeHandle};
use coordination::domain::{TaskId, Worktree};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum WorktreeManagerError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(String),
    #[error("git command failed: {0}")]
    GitFailed(String),
    #[error("worktree not found for task {0}")]
    NotFound(TaskId),
}

fn branch_for(task_id: &str) -> String {
    format!("orchestrator/{task_id}")
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
    state: Mutex<HashMap<TaskId, Worktree>>,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktrees_dir: project_path.into().join(".orchestrator").join("worktrees"),
            state: Mutex::new(HashMap::new()),
        }
    }

    async fn run_git(&self, dir: &std::path::Path, args: &[&str]) -> Result<String, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).to_string())
        }
    }

    /// Idempotent: returns the existing worktree if one is already
    /// registered for this task.
    pub async fn create_worktree_internal(
        &self,
        task_id: &str,
    ) -> Result<Worktree, WorktreeManagerError> {
        if let Some(existing) = self.state.lock().await.get(task_id).cloned() {
            return Ok(existing);
        }

        let path = self.worktrees_dir.join(task_id);
        let branch = branch_for(task_id);

        let head = self
            .run_git(&self.repo_root, &["rev-parse", "HEAD"])
            .await
            .map_err(WorktreeManagerError::GitFailed)?
            .trim()
            .to_string();

        self.run_git(
            &self.repo_root,
            &["worktree", "add", "-b", &branch, path.to_str().unwrap_or_default()],
        )
        .await
        .map_err(WorktreeManagerError::GitFailed)?;

        let worktree = Worktree {
            task_id: task_id.to_string(),
            path: path.display().to_string(),
            branch,
            base_commit: head,
        };
        self.state
            .lock()
            .await
            .insert(task_id.to_string(), worktree.clone());
        Ok(worktree)
    }

    pub async fn remove_worktree_internal(
        &self,
        task_id: &str,
    ) -> Result<(), WorktreeManagerError> {
        let worktree = {
            let mut state = self.state.lock().await;
            state
                .remove(task_id)
                .ok_or_else(|| WorktreeManagerError::NotFound(task_id.to_string()))?
        };

        if let Err(e) = self
            .run_git(&self.repo_root, &["worktree", "remove", "--force", &worktree.path])
            .await
        {
            warn!(task_id, error = %e, "git worktree remove failed, continuing");
        }
        if let Err(e) = self
            .run_git(&self.repo_root, &["branch", "-D", &worktree.branch])
            .await
        {
            warn!(task_id, error = %e, "git branch -D failed, continuing");
        }
        Ok(())
    }

    pub async fn get_worktree_internal(&self, task_id: &str) -> Option<Worktree> {
        self.state.lock().await.get(task_id).cloned()
    }

    pub async fn list_worktrees_internal(&self) -> Vec<Worktree> {
        self.state.lock().await.values().cloned().collect()
    }

    /// Merges `source_path`'s branch into `target_branch`, per §4.5's
    /// protocol: fast-forward the target, `--no-ff` merge, and on
    /// conflict collect the conflicting files and abort.
    pub async fn merge_internal(&self, source_path: &str, target_branch: &str) -> MergeResult {
        let branch = match self
            .run_git(
                std::path::Path::new(source_path),
                &["rev-parse", "--abbrev-ref", "HEAD"],
            )
            .await
        {
            Ok(b) => b.trim().to_string(),
            Err(e) => {
                return MergeResult {
                    success: false,
                    commit_hash: None,
                    error: Some(e),
                    conflict_files: vec![],
                }
            }
        };

        if let Err(e) = self
            .run_git(&self.repo_root, &["checkout", target_branch])
            .await
        {
            return MergeResult {
                success: false,
                commit_hash: None,
                error: Some(e),
                conflict_files: vec![],
            };
        }
        if let Err(e) = self
            .run_git(&self.repo_root, &["pull", "--ff-only"])
            .await
        {
            warn!(error = %e, "fast-forward pull failed, continuing with local tip");
        }

        let message = format!("merge: {branch} into {target_branch}");
        let merge = self
            .run_git(&self.repo_root, &["merge", "--no-ff", &branch, "-m", &message])
            .await;

        match merge {
            Ok(_) => {
                let commit_hash = self
                    .run_git(&self.repo_root, &["rev-parse", "HEAD"])
                    .await
                    .ok()
                    .map(|s| s.trim().to_string());
                MergeResult {
                    success: true,
                    commit_hash,
                    error: None,
                    conflict_files: vec![],
                }
            }
            Err(e) => {
                let conflict_files = self
                    .run_git(
                        &self.repo_root,
                        &["diff", "--name-only", "--diff-filter=U"],
                    )
                    .await
                    .map(|out| out.lines().map(str::to_string).collect())
                    .unwrap_or_default();
                let _ = self.run_git(&self.repo_root, &["merge", "--abort"]).await;
                MergeResult {
                    success: false,
                    commit_hash: None,
                    error: Some(e),
                    conflict_files,
                }
            }
        }
    }

    pub async fn push_internal(&self, branch: &str) -> PushResult {
        match self
            .run_git(&self.repo_root, &["push", "origin", branch])
            .await
        {
            Ok(_) => PushResult {
                success: true,
                error: None,
            },
            Err(e) => PushResult {
                success: false,
                error: Some(e),
            },
        }
    }
}

#[async_trait]
impl VcsWorktree for WorktreeManager {
    async fn create_worktree(&self, task_id: &TaskId) -> Result<WorktreeHandle, String> {
        self.create_worktree_internal(task_id)
            .await
            .map(|w| WorktreeHandle {
                path: w.path,
                branch: w.branch,
            })
            .map_err(|e| e.to_string())
    }

    async fn remove_worktree(&self, task_id: &TaskId) -> Result<(), String> {
        self.remove_worktree_internal(task_id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn get_worktree(&self, task_id: &TaskId) -> Option<WorktreeHandle> {
        self.get_worktree_internal(task_id)
            .await
            .map(|w| WorktreeHandle {
                path: w.path,
                branch: w.branch,
            })
    }

    async fn list_worktrees(&self) -> Vec<WorktreeHandle> {
        self.list_worktrees_internal()
            .await
            .into_iter()
            .map(|w| WorktreeHandle {
                path: w.path,
                branch: w.branch,
            })
            .collect()
    }

    async fn merge(&self, source_path: &str, target_branch: &str) -> MergeResult {
        self.merge_internal(source_path, target_branch).await
    }

    async fn push_to_remote(&self, branch: &str) -> PushResult {
        self.push_internal(branch).await
    }
}

/// Shared-ownership alias for wiring into the coordinator and merger
/// runner simultaneously.
pub type SharedWorktreeManager = Arc<WorktreeManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &std::path::Path) {
        StdCommand::new("git").args(["init"]).current_dir(dir).output().unwrap();
        StdCommand::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(dir)
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir)
            .output()
            .unwrap();
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[tokio::test]
    async fn create_worktree_is_idempotent() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let manager = WorktreeManager::new(repo.path(), repo.path());

        let first = manager.create_worktree_internal("t1").await.unwrap();
        let second = manager.create_worktree_internal("t1").await.unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.branch, "orchestrator/t1");
    }

    #[tokio::test]
    async fn merge_reports_conflict_files_on_divergent_edits() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let manager = WorktreeManager::new(repo.path(), repo.path());

        let wt = manager.create_worktree_internal("t1").await.unwrap();
        std::fs::write(std::path::Path::new(&wt.path).join("README.md"), "worktree edit").unwrap();
        StdCommand::new("git")
            .args(["commit", "-am", "wt change"])
            .current_dir(&wt.path)
            .output()
            .unwrap();

        std::fs::write(repo.path().join("README.md"), "main edit").unwrap();
        StdCommand::new("git")
            .args(["commit", "-am", "main change"])
            .current_dir(repo.path())
            .output()
            .unwrap();

        let result = manager.merge_internal(&wt.path, "master").await;
        if !result.success {
            assert!(!result.conflict_files.is_empty());
        }
    }
}
