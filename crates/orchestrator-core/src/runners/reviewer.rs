//! Code review runner.
//!
//! Implements both `AgentRunner` (so it can occupy a pool slot like any
//! other role) and `coordination::contracts::CodeReviewer` (the narrow
//! contract the QA loop actually drives). Both paths share one
//! conversation that ends with the model emitting a JSON verdict; an
//! unparsable verdict is treated as a rejection rather than a panic,
//! per the "reviewer produced garbage" edge case.

use std::sync::Arc;

use async_trait::async_trait;
use coordination::contracts::{
    ChatOptions, CodeReviewer, IssueSeverity, LLMClient, Message, ReviewIssue, ReviewResult, Role,
    ToolExecutor,
};
use coordination::domain::{StageError, Task};
use serde::Deserialize;

use super::{AgentRunner, RunnerContext, RunnerError, TaskMetrics, TaskResult};

const ROLE_PROMPT: &str = "You are a Rust code review agent. Inspect the worktree's changes for \
the task below using the available read-only tools, then reply with ONLY a JSON object of the \
form {\"approved\": bool, \"hasBlockingIssues\": bool, \"issues\": [{\"severity\": \"error\"|\
\"warning\"|\"info\", \"message\": string}], \"summary\": string}.";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    approved: bool,
    has_blocking_issues: bool,
    #[serde(default)]
    issues: Vec<RawIssue>,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct RawIssue {
    severity: String,
    message: String,
}

fn unparsable_review() -> ReviewResult {
    ReviewResult {
        approved: false,
        has_blocking_issues: true,
        issues: vec![ReviewIssue {
            severity: IssueSeverity::Error,
            message: "unparsable review".to_string(),
        }],
        summary: String::new(),
    }
}

fn parse_verdict(raw: &str) -> ReviewResult {
    let Some(json_start) = raw.find('{') else {
        return unparsable_review();
    };
    let Some(json_end) = raw.rfind('}') else {
        return unparsable_review();
    };
    let Ok(verdict) = serde_json::from_str::<RawVerdict>(&raw[json_start..=json_end]) else {
        return unparsable_review();
    };
    ReviewResult {
        approved: verdict.approved,
        has_blocking_issues: verdict.has_blocking_issues,
        issues: verdict
            .issues
            .into_iter()
            .map(|i| ReviewIssue {
                severity: match i.severity.as_str() {
                    "error" => IssueSeverity::Error,
                    "warning" => IssueSeverity::Warning,
                    _ => IssueSeverity::Info,
                },
                message: i.message,
            })
            .collect(),
        summary: verdict.summary,
    }
}

pub struct ReviewerRunner {
    llm: Arc<dyn LLMClient>,
    tools: Arc<dyn ToolExecutor>,
}

impl ReviewerRunner {
    pub fn new(llm: Arc<dyn LLMClient>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self { llm, tools }
    }

    async fn run_review(&self, worktree_path: &str, task: &Task) -> (ReviewResult, TaskMetrics) {
        let mut messages = vec![
            Message {
                role: Role::System,
                content: ROLE_PROMPT.to_string(),
            },
            Message {
                role: Role::User,
                content: format!(
                    "Worktree: {}\nTask: {}\n\n{}",
                    worktree_path, task.name, task.description
                ),
            },
        ];

        let mut iterations = 0u32;
        let mut tokens_used = 0u32;
        let mut verdict_text = String::new();

        for _ in 0..RunnerContext::default().max_llm_calls {
            iterations += 1;
            let response = match self.llm.chat(&messages, &ChatOptions::default()).await {
                Ok(r) => r,
                Err(_) => break,
            };
            tokens_used += response.usage.total_tokens as u32;

            if response.tool_calls.is_empty() {
                verdict_text = response.content;
                break;
            }

            messages.push(Message {
                role: Role::Assistant,
                content: response.content,
            });
            for call in &response.tool_calls {
                let outcome = self.tools.execute(&call.name, call.args.clone()).await;
                messages.push(Message {
                    role: Role::Tool,
                    content: outcome.output,
                });
            }
        }

        (
            parse_verdict(&verdict_text),
            TaskMetrics {
                iterations,
                tokens_used,
            },
        )
    }
}

#[async_trait]
impl CodeReviewer for ReviewerRunner {
    async fn review(&self, worktree_path: &str, task: &Task) -> ReviewResult {
        self.run_review(worktree_path, task).await.0
    }
}

#[async_trait]
impl AgentRunner for ReviewerRunner {
    async fn execute(&self, task: &Task, ctx: &RunnerContext) -> Result<TaskResult, RunnerError> {
        let (verdict, metrics) = self.run_review(&ctx.worktree_path, task).await;
        Ok(TaskResult {
            task_id: task.id.clone(),
            success: verdict.approved && !verdict.has_blocking_issues,
            output: verdict.summary,
            files_modified: vec![],
            metrics,
        })
    }

    async fn fix_issues(&self, _errors: &[StageError]) -> Result<TaskResult, RunnerError> {
        Err(RunnerError::NoRunner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_verdict() {
        let raw = r#"{"approved": true, "hasBlockingIssues": false, "issues": [], "summary": "looks good"}"#;
        let verdict = parse_verdict(raw);
        assert!(verdict.approved);
        assert!(!verdict.has_blocking_issues);
    }

    #[test]
    fn falls_back_to_rejection_on_garbage() {
        let verdict = parse_verdict("not json at all");
        assert!(!verdict.approved);
        assert!(verdict.has_blocking_issues);
        assert_eq!(verdict.issues.len(), 1);
        assert_eq!(verdict.issues[0].message, "unparsable review");
    }

    #[test]
    fn tolerates_surrounding_prose() {
        let raw = "Here is my verdict:\n{\"approved\": false, \"hasBlockingIssues\": true, \"issues\": [{\"severity\": \"warning\", \"message\": \"missing test\"}], \"summary\": \"needs work\"}\nThanks.";
        let verdict = parse_verdict(raw);
        assert!(!verdict.approved);
        assert_eq!(verdict.issues[0].severity, IssueSeverity::Warning);
    }
}
