//! Coder and general-purpose fixer runner.
//!
//! Conversation-loop shape follows the teacher's worker-agent
//! construction pattern (`agents/coder.rs`): role preamble, temperature,
//! bounded turns, tool whitelist — generalised here from a concrete
//! rig-core `Agent<M>` build to the abstract `LLMClient`/`ToolExecutor`
//! collaborators so the runner stays mockable in tests.

use std::sync::Arc;

use async_trait::async_trait;
use coordination::contracts::{ChatOptions, LLMClient, Message, Role, ToolExecutor};
use coordination::domain::{StageError, Task};
use tokio::sync::Mutex;

use super::{AgentRunner, RunnerContext, RunnerError, TaskMetrics, TaskResult};

const ROLE_PROMPT: &str = "You are a Rust coding agent. Make the minimal changes \
needed to satisfy the task, using the available tools. Reply with \
[TASK_COMPLETE] once the task's files are in their final state.";

pub struct CoderRunner {
    llm: Arc<dyn LLMClient>,
    tools: Arc<dyn ToolExecutor>,
    /// Last conversation, kept so `fix_issues` can resume it.
    last_conversation: Mutex<Option<Vec<Message>>>,
}

impl CoderRunner {
    pub fn new(llm: Arc<dyn LLMClient>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            llm,
            tools,
            last_conversation: Mutex::new(None),
        }
    }

    async fn drive_conversation(
        &self,
        mut messages: Vec<Message>,
        ctx: &RunnerContext,
        task_id: &str,
    ) -> Result<TaskResult, RunnerError> {
        let mut iterations = 0u32;
        let mut tokens_used = 0u32;
        let mut files_modified = Vec::new();

        loop {
            iterations += 1;
            if iterations > ctx.max_llm_calls {
                break;
            }

            let response = self.llm.chat(&messages, &ChatOptions::default()).await?;
            tokens_used += response.usage.total_tokens as u32;

            messages.push(Message {
                role: Role::Assistant,
                content: response.content.clone(),
            });

            if response.tool_calls.is_empty() {
                if response.content.contains(&ctx.completion_sentinel) {
                    break;
                }
                break;
            }

            for call in &response.tool_calls {
                let outcome = self.tools.execute(&call.name, call.args.clone()).await;
                if call.name == "write_file" || call.name == "edit_file" {
                    if let Some(path) = call.args.get("path").and_then(|v| v.as_str()) {
                        files_modified.push(path.to_string());
                    }
                }
                messages.push(Message {
                    role: Role::Tool,
                    content: outcome.output,
                });
            }

            if response.content.contains(&ctx.completion_sentinel) {
                break;
            }
        }

        *self.last_conversation.lock().await = Some(messages.clone());

        Ok(TaskResult {
            task_id: task_id.to_string(),
            success: true,
            output: messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            files_modified,
            metrics: TaskMetrics {
                iterations,
                tokens_used,
            },
        })
    }
}

#[async_trait]
impl AgentRunner for CoderRunner {
    async fn execute(&self, task: &Task, ctx: &RunnerContext) -> Result<TaskResult, RunnerError> {
        let messages = vec![
            Message {
                role: Role::System,
                content: ROLE_PROMPT.to_string(),
            },
            Message {
                role: Role::User,
                content: task_prompt(task),
            },
        ];
        self.drive_conversation(messages, ctx, &task.id).await
    }

    /// Resumes the most recent conversation with a new user turn
    /// summarising the errors. Requires `execute` to have run at least
    /// once.
    async fn fix_issues(&self, errors: &[StageError]) -> Result<TaskResult, RunnerError> {
        let mut conversation = self
            .last_conversation
            .lock()
            .await
            .clone()
            .ok_or(RunnerError::NoActiveTask)?;

        conversation.push(Message {
            role: Role::User,
            content: format_errors(errors),
        });

        self.drive_conversation(conversation, &RunnerContext::default(), "fix")
            .await
    }
}

fn task_prompt(task: &Task) -> String {
    format!(
        "Task: {}\n\n{}\n\nFiles expected to be touched: {:?}\nTest criteria: {:?}",
        task.name, task.description, task.files, task.test_criteria
    )
}

fn format_errors(errors: &[StageError]) -> String {
    let lines: Vec<String> = errors
        .iter()
        .map(|e| {
            format!(
                "{}{}: {}",
                e.file.as_deref().unwrap_or("<unknown>"),
                e.line.map(|l| format!(":{l}")).unwrap_or_default(),
                e.message
            )
        })
        .collect();
    format!(
        "The previous attempt failed verification. Fix the following issues:\n{}",
        lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::contracts::{ChatResponse, FinishReason, StreamChunk, ToolOutcome, Usage};
    use coordination::domain::TaskStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMClient for StubLlm {
        async fn chat(
            &self,
            _messages: &[Message],
            _options: &ChatOptions,
        ) -> Result<ChatResponse, coordination::contracts::LlmBackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: "done [TASK_COMPLETE]".to_string(),
                tool_calls: vec![],
                usage: Usage {
                    total_tokens: 10,
                    ..Default::default()
                },
                finish_reason: FinishReason::Stop,
                thinking: None,
            })
        }

        async fn chat_stream(
            &self,
            _messages: &[Message],
            _options: &ChatOptions,
        ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, coordination::contracts::LlmBackendError>
        {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }

        fn count_tokens(&self, text: &str) -> u32 {
            (text.len() / 4) as u32
        }
    }

    struct StubTools;

    #[async_trait]
    impl ToolExecutor for StubTools {
        async fn execute(&self, _name: &str, _args: serde_json::Value) -> ToolOutcome {
            ToolOutcome {
                success: true,
                output: "ok".to_string(),
            }
        }
    }

    fn sample_task() -> Task {
        Task {
            id: "t1".into(),
            name: "add docs".into(),
            description: "add a doc comment".into(),
            files: vec!["src/lib.rs".into()],
            test_criteria: vec![],
            estimated_minutes: 5,
            priority: 0,
            depends_on: vec![],
            wave_id: 0,
            status: TaskStatus::Assigned,
        }
    }

    #[tokio::test]
    async fn execute_stops_on_completion_sentinel() {
        let llm = Arc::new(StubLlm {
            calls: AtomicUsize::new(0),
        });
        let runner = CoderRunner::new(llm.clone(), Arc::new(StubTools));
        let result = runner
            .execute(&sample_task(), &RunnerContext::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fix_issues_without_prior_execute_fails() {
        let runner = CoderRunner::new(Arc::new(StubLlm {
            calls: AtomicUsize::new(0),
        }), Arc::new(StubTools));
        let err = runner.fix_issues(&[]).await.unwrap_err();
        assert!(matches!(err, RunnerError::NoActiveTask));
    }
}
