//! Worker agent: executes exactly one task inside its own worktree.
//!
//! A worker drives external conversation loops through three phases:
//! analyze (read-only exploration), decide (strategy turn), execute
//! (write-capable loop). Every tool call is gated by the boundary checker
//! with the worker role and the task's module binding; accepted writes are
//! buffered in memory and flushed through the worktree controller as one
//! apply-and-commit step. Merging is not the worker's concern; it only
//! ever commits to its own branch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::boundary::{ActorRole, BoundaryChecker};
use crate::bus::{event_types, EventBus};
use crate::conversation::{ConversationLoop, LoopError, LoopEvent, LoopFactory, LoopPurpose};
use crate::tools::{ChangeBuffer, ToolCallInput, ToolContext, ToolRegistry};
use crate::worktree::{WorkspaceRecord, WorktreeController};

/// Hard cap on loop events per phase; a model that never signals
/// completion is a terminal failure, not an infinite burn.
const MAX_LOOP_EVENTS: usize = 512;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Analyzing,
    Deciding,
    Executing,
    Committing,
    Done,
    Failed,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Analyzing => "analyzing",
            Self::Deciding => "deciding",
            Self::Executing => "executing",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a worker is asked to do.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task_id: String,
    pub task_name: String,
    pub description: String,
    pub brief: String,
    pub target_files: Vec<String>,
    pub constraints: Vec<String>,
    pub module_id: Option<String>,
    pub model: String,
}

/// What a worker reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,
    pub files_modified: Vec<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_run: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<u32>,
}

impl TaskResult {
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            files_modified: Vec::new(),
            summary: error.clone(),
            error: Some(error),
            tests_run: None,
            tests_passed: None,
        }
    }
}

/// Strategy the model commits to before executing. Parsed leniently from
/// the strategy turn; a malformed response falls back to defaults rather
/// than failing the task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerStrategy {
    pub should_write_tests: bool,
    pub test_reason: String,
    pub steps: Vec<String>,
    pub estimated_minutes: u32,
    pub model_selection: Option<String>,
}

/// Cooperative cancellation handle. Workers check it between tool
/// invocations and at turn starts; the coordinator additionally races the
/// whole worker future against [`cancelled`](Self::cancelled) so a hung
/// backend cannot outlive a stop request.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<tokio::sync::watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = tokio::sync::watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
enum WorkerFailure {
    #[error("cancelled")]
    Cancelled,
    #[error("conversation exceeded {MAX_LOOP_EVENTS} events without completing")]
    MaxTurns,
    #[error("{0}")]
    Loop(#[from] LoopError),
    #[error("{0}")]
    Worktree(#[from] crate::worktree::WorktreeError),
}

// ---------------------------------------------------------------------------
// WorkerAgent
// ---------------------------------------------------------------------------

pub struct WorkerAgent {
    worker_id: String,
    request: WorkerRequest,
    workspace: WorkspaceRecord,
    controller: Arc<WorktreeController>,
    boundary: Arc<BoundaryChecker>,
    registry: Arc<ToolRegistry>,
    loops: Arc<dyn LoopFactory>,
    bus: Arc<EventBus>,
    blueprint_id: Option<String>,
    cancel: CancelToken,
    phase: WorkerPhase,
}

impl WorkerAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        request: WorkerRequest,
        workspace: WorkspaceRecord,
        controller: Arc<WorktreeController>,
        boundary: Arc<BoundaryChecker>,
        registry: Arc<ToolRegistry>,
        loops: Arc<dyn LoopFactory>,
        bus: Arc<EventBus>,
        blueprint_id: Option<String>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            request,
            workspace,
            controller,
            boundary,
            registry,
            loops,
            bus,
            blueprint_id,
            cancel,
            phase: WorkerPhase::Idle,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    /// Drive the task to a terminal state and report the result. All
    /// internal failures are folded into the returned `TaskResult`; the
    /// worker never panics the pipeline.
    pub async fn run(mut self) -> TaskResult {
        match self.execute().await {
            Ok(result) => {
                self.set_phase(WorkerPhase::Done);
                self.bus.emit(
                    event_types::WORKER_TASK_COMPLETED,
                    self.blueprint_id.clone(),
                    serde_json::json!({
                        "workerId": self.worker_id,
                        "taskId": self.request.task_id,
                        "result": &result,
                    }),
                );
                result
            }
            Err(failure) => {
                self.set_phase(WorkerPhase::Failed);
                if matches!(failure, WorkerFailure::Cancelled) {
                    // Cancelled workers leave nothing behind.
                    if let Err(e) = self.controller.destroy_workspace(&self.worker_id) {
                        tracing::warn!("cleanup after cancel failed: {e}");
                    }
                }
                let reason = failure.to_string();
                self.bus.emit(
                    event_types::WORKER_TASK_FAILED,
                    self.blueprint_id.clone(),
                    serde_json::json!({
                        "workerId": self.worker_id,
                        "taskId": self.request.task_id,
                        "error": reason,
                        "reason": reason,
                    }),
                );
                TaskResult::failure(reason)
            }
        }
    }

    async fn execute(&mut self) -> Result<TaskResult, WorkerFailure> {
        // Phase 1: read-only analysis.
        self.set_phase(WorkerPhase::Analyzing);
        self.bus.emit(
            event_types::WORKER_ANALYZING,
            self.blueprint_id.clone(),
            serde_json::json!({
                "workerId": self.worker_id,
                "taskId": self.request.task_id,
            }),
        );
        let mut analysis_loop = self
            .loops
            .open(&self.request.task_id, LoopPurpose::Analysis);
        let analysis = self
            .run_turn(analysis_loop.as_mut(), self.analysis_prompt(), None)
            .await?;
        self.bus.emit(
            event_types::WORKER_ANALYZED,
            self.blueprint_id.clone(),
            serde_json::json!({
                "workerId": self.worker_id,
                "taskId": self.request.task_id,
                "analysis": &analysis,
            }),
        );

        // Phase 2: strategy decision, a second turn of the same loop.
        self.set_phase(WorkerPhase::Deciding);
        let strategy_text = self
            .run_turn(analysis_loop.as_mut(), self.strategy_prompt(&analysis), None)
            .await?;
        let strategy = parse_strategy(&strategy_text);
        self.bus.emit(
            event_types::WORKER_STRATEGY_DECIDED,
            self.blueprint_id.clone(),
            serde_json::json!({
                "workerId": self.worker_id,
                "strategy": &strategy,
            }),
        );
        drop(analysis_loop);

        // Phase 3: write-capable execution loop.
        self.set_phase(WorkerPhase::Executing);
        let buffer = ChangeBuffer::new();
        let mut execution_loop = self
            .loops
            .open(&self.request.task_id, LoopPurpose::Execution);
        let completion = self
            .run_turn(
                execution_loop.as_mut(),
                self.execution_prompt(&analysis, &strategy),
                Some(&buffer),
            )
            .await?;

        // Phase 4: flush buffered changes as one commit on the branch.
        self.set_phase(WorkerPhase::Committing);
        let files_modified = buffer.touched_paths();
        let changes = buffer.drain();
        self.controller
            .apply_changes(&self.worker_id, &changes, &self.request.task_name)?;

        let summary = if completion.trim().is_empty() {
            analysis
        } else {
            completion
        };
        Ok(TaskResult {
            success: true,
            files_modified,
            summary,
            error: None,
            tests_run: None,
            tests_passed: None,
        })
    }

    /// Drive one conversation turn to completion, executing tool calls as
    /// they stream in. Returns the accumulated text of the turn.
    async fn run_turn(
        &self,
        convo: &mut dyn ConversationLoop,
        prompt: String,
        buffer: Option<&ChangeBuffer>,
    ) -> Result<String, WorkerFailure> {
        if self.cancel.is_cancelled() {
            return Err(WorkerFailure::Cancelled);
        }
        convo.start_turn(prompt).await?;

        let mut text = String::new();
        let mut events = 0usize;
        loop {
            events += 1;
            if events > MAX_LOOP_EVENTS {
                return Err(WorkerFailure::MaxTurns);
            }
            match convo.next_event().await? {
                LoopEvent::Text { content } => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&content);
                }
                LoopEvent::ToolStart {
                    tool_name,
                    tool_input,
                } => {
                    // Cancellation is checked between tool invocations.
                    if self.cancel.is_cancelled() {
                        convo.interrupt().await;
                        continue;
                    }
                    let result = self.dispatch_tool(&tool_name, tool_input, buffer);
                    convo.submit_tool_result(&tool_name, result).await?;
                }
                LoopEvent::ToolEnd { .. } => {}
                LoopEvent::Done => return Ok(text),
                LoopEvent::Interrupted => return Err(WorkerFailure::Cancelled),
            }
        }
    }

    /// Gate and execute one tool call. Errors (including boundary denials)
    /// come back as `Err(text)` and are fed to the model, which may adapt
    /// and try a different path.
    fn dispatch_tool(
        &self,
        tool_name: &str,
        tool_input: serde_json::Value,
        buffer: Option<&ChangeBuffer>,
    ) -> Result<serde_json::Value, String> {
        if buffer.is_none() && !ToolRegistry::is_read_only(tool_name) {
            return Err(format!("tool {tool_name} is not available during analysis"));
        }
        if !self.registry.contains(tool_name) {
            return Err(format!("unknown tool: {tool_name}"));
        }
        let ctx = ToolContext {
            boundary: &self.boundary,
            role: ActorRole::Worker,
            module_id: self.request.module_id.as_deref(),
            worktree: &self.workspace.worktree_path,
            buffer,
        };
        match self.registry.invoke(
            &ctx,
            ToolCallInput {
                name: tool_name.to_string(),
                args: tool_input,
            },
        ) {
            Ok(output) => serde_json::to_value(&output).map_err(|e| e.to_string()),
            Err(error) => Err(error.to_string()),
        }
    }

    fn set_phase(&mut self, phase: WorkerPhase) {
        self.phase = phase;
        self.bus.emit(
            event_types::WORKER_STATUS_UPDATED,
            self.blueprint_id.clone(),
            serde_json::json!({
                "workerId": self.worker_id,
                "phase": phase,
            }),
        );
    }

    // -- prompts ------------------------------------------------------------

    fn analysis_prompt(&self) -> String {
        format!(
            "Task: {name}\n\n{description}\n\nTarget files:\n{files}\n\n\
             Explore the workspace with the read-only tools. Summarize the \
             target files, their dependencies, and anything that constrains \
             the change. Finish with observations and suggestions.",
            name = self.request.task_name,
            description = self.request.description,
            files = bullet_list(&self.request.target_files),
        )
    }

    fn strategy_prompt(&self, analysis: &str) -> String {
        format!(
            "Based on your analysis:\n\n{analysis}\n\nDecide how to execute. \
             Respond with a JSON object: {{\"shouldWriteTests\": bool, \
             \"testReason\": string, \"steps\": [string], \
             \"estimatedMinutes\": number, \"modelSelection\": string|null}}.",
        )
    }

    fn execution_prompt(&self, analysis: &str, strategy: &WorkerStrategy) -> String {
        format!(
            "Brief: {brief}\n\nAnalysis:\n{analysis}\n\nPlanned steps:\n{steps}\n\n\
             Constraints:\n{constraints}\n\nModel: {model}\n\n\
             Execute the task with the available tools. Signal completion \
             when the change is finished.",
            brief = self.request.brief,
            steps = bullet_list(&strategy.steps),
            constraints = bullet_list(&self.request.constraints),
            model = strategy
                .model_selection
                .as_deref()
                .unwrap_or(&self.request.model),
        )
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        "- (none)".to_string()
    } else {
        items
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pull the first JSON object out of a model response and parse it as a
/// strategy; anything unparseable yields the default strategy.
fn parse_strategy(text: &str) -> WorkerStrategy {
    extract_json_object(text)
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

/// First balanced `{...}` block in `text`, tolerant of surrounding prose
/// and markdown fences.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
