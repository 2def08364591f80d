//! Harness binary: wires a concrete `LLMClient`/tool/VCS stack into the
//! orchestration core and runs one project to completion.
//!
//! Grounded on the teacher's `main.rs` startup shape (env-driven
//! endpoint config, health check before work starts, `tracing_subscriber`
//! init) but drives the `Coordinator`'s wave loop instead of the
//! teacher's single-issue `process_issue` loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use coordination::contracts::{
    BuildVerifier, ChatOptions, ChatResponse, CodeReviewer, FinishReason, IssueSeverity,
    LintRunner, LlmBackendError, Message, PlanningTask, ReviewIssue, ReviewResult, Role,
    StreamChunk, TaskDecomposer, TestFailure, TestResult, TestRunner, ToolExecutor, ToolOutcome,
    Usage, VerifyResult,
};
use coordination::domain::{AgentType, StageError, Task};
use coordination::feedback::compiler::Compiler;
use coordination::{EventBus, OrchestratorEvent, ProjectConfig};
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;
use tracing::{error, info, warn};

use orchestrator_core::coordinator::{Coordinator, QaGates};
use orchestrator_core::runners::{AgentRunner, CoderRunner, MergerRunner, NoRunner, ReviewerRunner, TesterRunner};
use orchestrator_core::{AgentPool, WorktreeManager};

#[derive(Parser, Debug)]
#[command(name = "orchestrator-core", about = "Multi-agent orchestration harness")]
struct Cli {
    /// Path to a project config TOML file. Falls back to a minimal
    /// default scoped to the current directory when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Feature descriptions to decompose and schedule, one per flag.
    #[arg(long = "feature")]
    features: Vec<String>,

    /// Branch the merger runner folds completed task branches into.
    #[arg(long, default_value = "main")]
    target_branch: String,
}

/// Env-driven OpenAI-compatible endpoint, mirroring the teacher's
/// `SWARM_*_URL`/`SWARM_*_MODEL` convention for a single coder model.
struct EndpointConfig {
    base_url: String,
    api_key: String,
    model: String,
}

impl EndpointConfig {
    fn from_env() -> Self {
        Self {
            base_url: std::env::var("ORCHESTRATOR_LLM_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080/v1".to_string()),
            api_key: std::env::var("ORCHESTRATOR_LLM_API_KEY").unwrap_or_default(),
            model: std::env::var("ORCHESTRATOR_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        }
    }
}

async fn check_endpoint(base_url: &str) -> bool {
    let client = reqwest::Client::new();
    match client
        .get(format!("{base_url}/models"))
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Adapts rig-core's `Agent` to the abstract `LLMClient` contract.
///
/// Single-shot completion only — tool-calling goes through the
/// orchestrator's own `ToolExecutor`, not rig's, so every response comes
/// back with an empty `tool_calls` list and callers rely on the
/// completion sentinel instead.
struct RigLlmClient {
    agent: rig::agent::Agent<openai::responses_api::ResponsesCompletionModel>,
}

impl RigLlmClient {
    fn new(client: &openai::Client, model: &str) -> Self {
        let agent = client.agent(model).build();
        Self { agent }
    }
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            format!("[{role}]\n{}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl coordination::contracts::LLMClient for RigLlmClient {
    async fn chat(
        &self,
        messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, LlmBackendError> {
        let prompt = render_transcript(messages);
        let content = self
            .agent
            .prompt(prompt)
            .await
            .map_err(|e| LlmBackendError::BackendUnavailable(e.to_string()))?;
        Ok(ChatResponse {
            content,
            tool_calls: vec![],
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
            thinking: None,
        })
    }

    async fn chat_stream(
        &self,
        _messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, LlmBackendError> {
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        Ok(rx)
    }

    fn count_tokens(&self, text: &str) -> u32 {
        (text.len() / 4) as u32
    }
}

/// Tool executor rooted at the process's current directory. The harness
/// runs one worktree at a time, so a single root is sufficient; a
/// multi-tenant deployment would thread the active worktree path through
/// instead.
struct FsToolExecutor {
    root: PathBuf,
}

impl FsToolExecutor {
    fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

#[async_trait]
impl ToolExecutor for FsToolExecutor {
    async fn execute(&self, name: &str, args: serde_json::Value) -> ToolOutcome {
        let path_arg = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        match name {
            "read_file" => match tokio::fs::read_to_string(self.resolve(path_arg)).await {
                Ok(content) => ToolOutcome { success: true, output: content },
                Err(e) => ToolOutcome { success: false, output: e.to_string() },
            },
            "write_file" | "edit_file" => {
                let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
                let target = self.resolve(path_arg);
                if let Some(parent) = target.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                match tokio::fs::write(&target, content).await {
                    Ok(()) => ToolOutcome { success: true, output: format!("wrote {path_arg}") },
                    Err(e) => ToolOutcome { success: false, output: e.to_string() },
                }
            }
            "list_files" => {
                let dir = self.resolve(path_arg);
                match std::fs::read_dir(&dir) {
                    Ok(entries) => {
                        let names: Vec<String> = entries
                            .filter_map(|e| e.ok())
                            .map(|e| e.file_name().to_string_lossy().to_string())
                            .collect();
                        ToolOutcome { success: true, output: names.join("\n") }
                    }
                    Err(e) => ToolOutcome { success: false, output: e.to_string() },
                }
            }
            "search_code" => {
                let pattern = args.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
                let output = std::process::Command::new("grep")
                    .args(["-rn", pattern, "."])
                    .current_dir(&self.root)
                    .output();
                match output {
                    Ok(out) => ToolOutcome {
                        success: true,
                        output: String::from_utf8_lossy(&out.stdout).to_string(),
                    },
                    Err(e) => ToolOutcome { success: false, output: e.to_string() },
                }
            }
            "run_command" => {
                let cmd = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
                let parts = shlex::split(cmd).unwrap_or_default();
                let Some((bin, rest)) = parts.split_first() else {
                    return ToolOutcome { success: false, output: "empty command".to_string() };
                };
                match std::process::Command::new(bin).args(rest).current_dir(&self.root).output() {
                    Ok(out) => ToolOutcome {
                        success: out.status.success(),
                        output: format!(
                            "{}{}",
                            String::from_utf8_lossy(&out.stdout),
                            String::from_utf8_lossy(&out.stderr)
                        ),
                    },
                    Err(e) => ToolOutcome { success: false, output: e.to_string() },
                }
            }
            other => ToolOutcome { success: false, output: format!("unknown tool {other}") },
        }
    }
}

/// `cargo build --message-format=json` via the teacher's `Compiler`,
/// translated from diagnostic spans into `StageError`s.
struct CargoBuildVerifier;

#[async_trait]
impl BuildVerifier for CargoBuildVerifier {
    async fn verify(&self, worktree_path: &str) -> VerifyResult {
        let dir = worktree_path.to_string();
        let start = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || Compiler::new(&dir).build())
            .await
            .unwrap_or_else(|e| panic_to_compile_result(e));
        compile_result_to_verify(result, start.elapsed())
    }
}

struct CargoClippyLintRunner;

#[async_trait]
impl LintRunner for CargoClippyLintRunner {
    async fn lint(&self, worktree_path: &str) -> VerifyResult {
        let dir = worktree_path.to_string();
        let start = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || Compiler::new(&dir).clippy())
            .await
            .unwrap_or_else(|e| panic_to_compile_result(e));
        compile_result_to_verify(result, start.elapsed())
    }
}

fn panic_to_compile_result(
    e: tokio::task::JoinError,
) -> coordination::feedback::compiler::CompileResult {
    coordination::feedback::compiler::CompileResult {
        success: false,
        exit_code: None,
        messages: vec![],
        raw_stdout: String::new(),
        raw_stderr: format!("compiler task panicked: {e}"),
    }
}

fn compile_result_to_verify(
    result: coordination::feedback::compiler::CompileResult,
    elapsed: std::time::Duration,
) -> VerifyResult {
    let errors = result
        .errors()
        .into_iter()
        .filter_map(|m| m.as_diagnostic())
        .map(|d| StageError {
            file: d.primary_span().map(|s| s.file_name.clone()),
            line: d.primary_span().map(|s| s.line_start as u32),
            message: d.message.clone(),
            severity: Some("error".to_string()),
        })
        .collect();
    let warnings = result
        .warnings()
        .into_iter()
        .filter_map(|m| m.as_diagnostic())
        .map(|d| d.message.clone())
        .collect();
    VerifyResult {
        success: result.success,
        errors,
        warnings,
        duration_ms: elapsed.as_millis() as u64,
    }
}

struct CargoTestRunner;

#[async_trait]
impl TestRunner for CargoTestRunner {
    async fn run_tests(&self, worktree_path: &str, _test_criteria: &[String]) -> TestResult {
        let dir = worktree_path.to_string();
        let start = std::time::Instant::now();
        let output = tokio::task::spawn_blocking(move || {
            std::process::Command::new("cargo").arg("test").current_dir(&dir).output()
        })
        .await;
        let elapsed = start.elapsed().as_millis() as u64;
        match output {
            Ok(Ok(out)) => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let (passed, failed, failures) = parse_test_summary(&stdout);
                TestResult {
                    success: out.status.success(),
                    passed,
                    failed,
                    skipped: 0,
                    failures,
                    duration_ms: elapsed,
                }
            }
            _ => TestResult {
                success: false,
                passed: 0,
                failed: 0,
                skipped: 0,
                failures: vec![TestFailure {
                    name: "cargo test".to_string(),
                    message: "failed to invoke cargo test".to_string(),
                }],
                duration_ms: elapsed,
            },
        }
    }
}

/// Pulls pass/fail counts and failing test names out of libtest's plain
/// text summary (`test foo::bar ... FAILED`, `test result: ok. N passed`).
fn parse_test_summary(stdout: &str) -> (u32, u32, Vec<TestFailure>) {
    let mut passed = 0u32;
    let mut failed = 0u32;
    let mut failures = Vec::new();
    for line in stdout.lines() {
        if let Some(name) = line.strip_prefix("test ").and_then(|rest| rest.strip_suffix(" ... FAILED")) {
            failed += 1;
            failures.push(TestFailure {
                name: name.to_string(),
                message: "assertion failed".to_string(),
            });
        } else if line.contains(" ... ok") {
            passed += 1;
        }
    }
    (passed, failed, failures)
}

/// LLM-backed task decomposer: asks the model for a JSON array of
/// `PlanningTask`s and fails closed on unparsable output.
struct LlmTaskDecomposer {
    llm: Arc<dyn coordination::contracts::LLMClient>,
}

#[async_trait]
impl TaskDecomposer for LlmTaskDecomposer {
    async fn decompose(&self, description: &str) -> Result<Vec<PlanningTask>, String> {
        let prompt = format!(
            "Break the following feature into an ordered list of implementation tasks. \
             Respond with ONLY a JSON array of objects with fields: name, description, \
             files, test_criteria, estimated_minutes, depends_on (names of earlier tasks).\n\n\
             Feature: {description}"
        );
        let response = self
            .llm
            .chat(
                &[Message { role: Role::User, content: prompt }],
                &ChatOptions::default(),
            )
            .await
            .map_err(|e| e.to_string())?;
        let json_start = response.content.find('[').ok_or("no JSON array in response")?;
        let json_end = response.content.rfind(']').ok_or("no JSON array in response")?;
        serde_json::from_str(&response.content[json_start..=json_end])
            .map_err(|e| format!("unparsable decomposition: {e}"))
    }
}

/// Blind reviewer: sends the task's changed files summary to the model
/// and accepts its structured verdict, failing closed on parse errors.
struct LlmCodeReviewer {
    llm: Arc<dyn coordination::contracts::LLMClient>,
}

#[async_trait]
impl CodeReviewer for LlmCodeReviewer {
    async fn review(&self, worktree_path: &str, task: &Task) -> ReviewResult {
        let diff = std::process::Command::new("git")
            .args(["diff", "HEAD"])
            .current_dir(worktree_path)
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).to_string())
            .unwrap_or_default();
        let prompt = format!(
            "Review this diff for task \"{}\". Respond with ONLY JSON: \
             {{\"approved\": bool, \"has_blocking_issues\": bool, \"issues\": \
             [{{\"severity\": \"error|warning|info\", \"message\": string}}], \"summary\": string}}\n\n{diff}",
            task.name
        );
        let response = self
            .llm
            .chat(&[Message { role: Role::User, content: prompt }], &ChatOptions::default())
            .await;
        let Ok(response) = response else {
            return ReviewResult {
                approved: false,
                has_blocking_issues: true,
                issues: vec![ReviewIssue {
                    severity: IssueSeverity::Error,
                    message: "reviewer backend unavailable".to_string(),
                }],
                summary: "reviewer unavailable".to_string(),
            };
        };
        let json_start = response.content.find('{');
        let json_end = response.content.rfind('}');
        match (json_start, json_end) {
            (Some(s), Some(e)) if s < e => {
                serde_json::from_str(&response.content[s..=e]).unwrap_or_else(|_| ReviewResult {
                    approved: false,
                    has_blocking_issues: true,
                    issues: vec![ReviewIssue {
                        severity: IssueSeverity::Error,
                        message: "unparsable review response".to_string(),
                    }],
                    summary: response.content.clone(),
                })
            }
            _ => ReviewResult {
                approved: false,
                has_blocking_issues: true,
                issues: vec![],
                summary: response.content,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ProjectConfig::from_file(path).context("loading project config")?,
        None => {
            let mut config = ProjectConfig::default();
            config.project_path = std::env::current_dir()?;
            config.project_id = config
                .project_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "orchestrator-project".to_string());
            config
        }
    };

    let endpoint = EndpointConfig::from_env();
    info!(url = %endpoint.base_url, model = %endpoint.model, "Orchestrator starting");

    if !check_endpoint(&endpoint.base_url).await {
        warn!("LLM endpoint health check failed — continuing, calls may fail");
    }

    let openai_client = openai::Client::new(&endpoint.api_key);
    let llm: Arc<dyn coordination::contracts::LLMClient> =
        Arc::new(RigLlmClient::new(&openai_client, &endpoint.model));
    let tools: Arc<dyn ToolExecutor> = Arc::new(FsToolExecutor { root: config.project_path.clone() });

    let events = EventBus::new().shared();

    let repo_root = config.project_path.clone();
    let worktrees = Arc::new(WorktreeManager::new(repo_root.clone(), repo_root.clone()));

    let mut runners: HashMap<AgentType, Arc<dyn AgentRunner>> = HashMap::new();
    runners.insert(AgentType::Coder, Arc::new(CoderRunner::new(llm.clone(), tools.clone())));
    runners.insert(AgentType::Tester, Arc::new(TesterRunner::new(llm.clone(), tools.clone())));
    runners.insert(AgentType::Reviewer, Arc::new(ReviewerRunner::new(llm.clone(), tools.clone())));
    runners.insert(
        AgentType::Merger,
        Arc::new(MergerRunner::new(worktrees.clone(), cli.target_branch.clone())),
    );
    runners.insert(AgentType::Planner, Arc::new(NoRunner));

    let mut capacity = HashMap::new();
    for (name, n) in &config.max_agents_by_type {
        if let Some(agent_type) = parse_agent_type(name) {
            capacity.insert(agent_type, *n);
        }
    }
    let pool = Arc::new(AgentPool::new(runners, capacity, Some(events.clone())));

    let decomposer: Arc<dyn TaskDecomposer> = Arc::new(LlmTaskDecomposer { llm: llm.clone() });
    let reviewer: Arc<dyn CodeReviewer> = Arc::new(LlmCodeReviewer { llm: llm.clone() });

    let qa_gates = Arc::new(QaGates {
        build: Arc::new(CargoBuildVerifier),
        lint: Arc::new(CargoClippyLintRunner),
        test: Arc::new(CargoTestRunner),
    });

    let coordinator = Coordinator::new(
        config.clone(),
        pool,
        worktrees,
        events.clone(),
        Some(decomposer),
        Some(reviewer),
        None,
        Some(qa_gates),
    );

    let mut event_rx = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    let features = if cli.features.is_empty() {
        config.features.clone()
    } else {
        cli.features
    };

    if features.is_empty() {
        info!("No features configured. Nothing to do.");
        return Ok(());
    }

    coordinator.start(features).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let progress = coordinator.progress().await;
    info!(
        total = progress.total_tasks,
        completed = progress.completed_tasks,
        failed = progress.failed_tasks,
        "Orchestration finished"
    );
    if progress.failed_tasks > 0 {
        error!(failed = progress.failed_tasks, "Some tasks failed");
    }

    Ok(())
}

fn parse_agent_type(name: &str) -> Option<AgentType> {
    match name {
        "Coder" => Some(AgentType::Coder),
        "Tester" => Some(AgentType::Tester),
        "Reviewer" => Some(AgentType::Reviewer),
        "Merger" => Some(AgentType::Merger),
        "Planner" => Some(AgentType::Planner),
        _ => None,
    }
}

fn log_event(event: &OrchestratorEvent) {
    info!(event = event.event_type(), "{:?}", event);
}
