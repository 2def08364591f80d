//! QA loop engine: drives a task in a worktree through build, lint,
//! test, and review until all four pass or `max_iterations` is
//! exhausted.
//!
//! `run` is a free function rather than a struct method — it owns no
//! state across tasks, mirroring the teacher's gate-sequencing
//! (`coordination::verifier::report`) combined with the teacher's
//! bounded-iteration escalation accounting.

use coordination::contracts::{BuildVerifier, CodeReviewer, LintRunner, TestRunner};
use coordination::domain::{StageError, StageKind, StageResult, Task};
use coordination::feedback::ParsedError;
use coordination::verifier::{GateOutcome, GateResult, VerifierReport};

use crate::runners::{AgentRunner, RunnerError};

#[derive(Debug, Clone)]
pub enum QaOutcome {
    Success {
        iterations: u32,
        stages: Vec<StageResult>,
    },
    Escalated {
        reason: String,
        iterations: u32,
    },
}

struct StageRun {
    kind: StageKind,
    result: StageResult,
}

/// Runs one named stage in isolation; carries no side effects on
/// iteration counters. Exposed for ad-hoc invocation per §4.4.
pub async fn run_stage(
    stage: StageKind,
    worktree_path: &str,
    build: &dyn BuildVerifier,
    lint: &dyn LintRunner,
    test: &dyn TestRunner,
    review: &dyn CodeReviewer,
    task: &Task,
) -> StageResult {
    let start = std::time::Instant::now();
    match stage {
        StageKind::Build => {
            let r = build.verify(worktree_path).await;
            StageResult {
                stage,
                success: r.success,
                errors: r.errors,
                warnings: r.warnings,
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
        StageKind::Lint => {
            let r = lint.lint(worktree_path).await;
            StageResult {
                stage,
                success: r.success,
                errors: r.errors,
                warnings: r.warnings,
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
        StageKind::Test => {
            let r = test.run_tests(worktree_path, &task.test_criteria).await;
            let errors = r
                .failures
                .iter()
                .map(|f| StageError {
                    file: None,
                    line: None,
                    message: format!("{}: {}", f.name, f.message),
                    severity: Some("error".to_string()),
                })
                .collect();
            StageResult {
                stage,
                success: r.success,
                errors,
                warnings: vec![],
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
        StageKind::Review => {
            let r = review.review(worktree_path, task).await;
            let success = r.approved && !r.has_blocking_issues;
            let errors = r
                .issues
                .into_iter()
                .filter(|i| matches!(i.severity, coordination::contracts::IssueSeverity::Error))
                .map(|i| StageError {
                    file: None,
                    line: None,
                    message: i.message,
                    severity: Some("error".to_string()),
                })
                .collect();
            StageResult {
                stage,
                success,
                errors,
                warnings: vec![r.summary],
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
    }
}

fn gate_outcome_for(kind: StageKind, success: bool) -> (&'static str, GateOutcome) {
    let name = match kind {
        StageKind::Build => "build",
        StageKind::Lint => "lint",
        StageKind::Test => "test",
        StageKind::Review => "review",
    };
    (
        name,
        if success {
            GateOutcome::Passed
        } else {
            GateOutcome::Failed
        },
    )
}

/// Drives a single task through the fixed build → lint → test → review
/// sequence, repairing via `coder.fix_issues` and restarting at build on
/// any stage failure, up to `max_iterations` attempts (inclusive).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    build: &dyn BuildVerifier,
    lint: &dyn LintRunner,
    test: &dyn TestRunner,
    review: &dyn CodeReviewer,
    coder: &dyn AgentRunner,
    task: &Task,
    worktree_path: &str,
    max_iterations: u32,
) -> QaOutcome {
    let mut iteration = 0u32;

    loop {
        iteration += 1;
        if iteration > max_iterations {
            return QaOutcome::Escalated {
                reason: "qa_exhausted".to_string(),
                iterations: iteration - 1,
            };
        }

        let mut report = VerifierReport::new(worktree_path.to_string());
        let mut all_stages = Vec::new();
        let mut failed: Option<StageRun> = None;
        let attempt_start = std::time::Instant::now();

        for kind in [
            StageKind::Build,
            StageKind::Lint,
            StageKind::Test,
            StageKind::Review,
        ] {
            let result = run_stage(kind, worktree_path, build, lint, test, review, task).await;
            let (name, outcome) = gate_outcome_for(kind, result.success);
            let parsed_errors: Vec<ParsedError> = result
                .errors
                .iter()
                .map(ParsedError::from_stage_error)
                .collect();
            report.add_gate(GateResult {
                gate: name.to_string(),
                outcome,
                duration_ms: result.duration_ms,
                exit_code: None,
                error_count: result.errors.len(),
                warning_count: result.warnings.len(),
                errors: parsed_errors,
                stderr_excerpt: None,
            });
            all_stages.push(result.clone());

            if !result.success {
                failed = Some(StageRun { kind, result });
                break;
            }
        }

        report.finalize(attempt_start.elapsed());

        let Some(failed_stage) = failed else {
            return QaOutcome::Success {
                iterations: iteration,
                stages: all_stages,
            };
        };

        match coder.fix_issues(&failed_stage.result.errors).await {
            Ok(_) => continue,
            Err(RunnerError::Backend(e)) if !e.recoverable() => {
                return QaOutcome::Escalated {
                    reason: "backend_unavailable".to_string(),
                    iterations: iteration,
                };
            }
            Err(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coordination::contracts::{LlmBackendError, ReviewResult, TestResult, VerifyResult};
    use coordination::domain::TaskStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct AlwaysPass;

    #[async_trait]
    impl BuildVerifier for AlwaysPass {
        async fn verify(&self, _worktree_path: &str) -> VerifyResult {
            VerifyResult {
                success: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LintRunner for AlwaysPass {
        async fn lint(&self, _worktree_path: &str) -> VerifyResult {
            VerifyResult {
                success: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TestRunner for AlwaysPass {
        async fn run_tests(&self, _worktree_path: &str, _criteria: &[String]) -> TestResult {
            TestResult {
                success: true,
                passed: 3,
                failed: 0,
                skipped: 0,
                failures: vec![],
                duration_ms: 1,
            }
        }
    }

    #[async_trait]
    impl CodeReviewer for AlwaysPass {
        async fn review(&self, _worktree_path: &str, _task: &Task) -> ReviewResult {
            ReviewResult {
                approved: true,
                has_blocking_issues: false,
                issues: vec![],
                summary: "fine".to_string(),
            }
        }
    }

    struct FailNTimes {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl BuildVerifier for FailNTimes {
        async fn verify(&self, _worktree_path: &str) -> VerifyResult {
            if self.remaining.load(Ordering::SeqCst) > 0 {
                self.remaining.fetch_sub(1, Ordering::SeqCst);
                VerifyResult {
                    success: false,
                    errors: vec![StageError {
                        file: Some("src/lib.rs".into()),
                        line: Some(3),
                        message: "mismatched types".into(),
                        severity: Some("error".into()),
                    }],
                    warnings: vec![],
                    duration_ms: 1,
                }
            } else {
                VerifyResult {
                    success: true,
                    ..Default::default()
                }
            }
        }
    }

    struct StubCoder;

    #[async_trait]
    impl AgentRunner for StubCoder {
        async fn execute(
            &self,
            _task: &Task,
            _ctx: &crate::runners::RunnerContext,
        ) -> Result<crate::runners::TaskResult, RunnerError> {
            unimplemented!()
        }

        async fn fix_issues(
            &self,
            _errors: &[StageError],
        ) -> Result<crate::runners::TaskResult, RunnerError> {
            Ok(crate::runners::TaskResult {
                task_id: "t1".into(),
                success: true,
                output: String::new(),
                files_modified: vec![],
                metrics: crate::runners::TaskMetrics::default(),
            })
        }
    }

    struct UnavailableCoder;

    #[async_trait]
    impl AgentRunner for UnavailableCoder {
        async fn execute(
            &self,
            _task: &Task,
            _ctx: &crate::runners::RunnerContext,
        ) -> Result<crate::runners::TaskResult, RunnerError> {
            unimplemented!()
        }

        async fn fix_issues(
            &self,
            _errors: &[StageError],
        ) -> Result<crate::runners::TaskResult, RunnerError> {
            Err(RunnerError::Backend(LlmBackendError::BackendUnavailable(
                "down".into(),
            )))
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
    async fn succeeds_when_all_stages_pass_first_try() {
        let gates = AlwaysPass;
        let outcome = run(
            &gates,
            &gates,
            &gates,
            &gates,
            &StubCoder,
            &sample_task(),
            "/tmp/wt",
            50,
        )
        .await;
        assert!(matches!(outcome, QaOutcome::Success { iterations: 1, .. }));
    }

    #[tokio::test]
    async fn repairs_and_retries_on_build_failure() {
        let build = FailNTimes {
            remaining: AtomicU32::new(1),
        };
        let other = AlwaysPass;
        let outcome = run(
            &build,
            &other,
            &other,
            &other,
            &StubCoder,
            &sample_task(),
            "/tmp/wt",
            50,
        )
        .await;
        match outcome {
            QaOutcome::Success { iterations, .. } => assert_eq!(iterations, 2),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn escalates_when_iterations_exhausted() {
        let build = FailNTimes {
            remaining: AtomicU32::new(100),
        };
        let other = AlwaysPass;
        let outcome = run(
            &build, &other, &other, &other, &StubCoder, &sample_task(), "/tmp/wt", 3,
        )
        .await;
        match outcome {
            QaOutcome::Escalated { reason, iterations } => {
                assert_eq!(reason, "qa_exhausted");
                assert_eq!(iterations, 3);
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn escalates_immediately_on_unrecoverable_backend_error() {
        let build = FailNTimes {
            remaining: AtomicU32::new(100),
        };
        let other = AlwaysPass;
        let outcome = run(
            &build,
            &other,
            &other,
            &other,
            &UnavailableCoder,
            &sample_task(),
            "/tmp/wt",
            50,
        )
        .await;
        match outcome {
            QaOutcome::Escalated { reason, .. } => assert_eq!(reason, "backend_unavailable"),
            other => panic!("expected escalation, got {other:?}"),
        }
    }
}
