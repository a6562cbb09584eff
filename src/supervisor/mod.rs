//! Lead agent supervisor: the long-lived conversation that owns a run.
//!
//! Unlike workers, the supervisor's conversation never ends between tasks.
//! It is modeled as an actor owning one [`ConversationLoop`] and a command
//! channel; tool calls from the model become synchronous requests handled
//! inside the actor. Two tools are special: the plan tool mutates the
//! shared plan through an append-only operation log, and the dispatch tool
//! runs a worker to completion and hands its result back into the
//! conversation. Everything else (read, search, shell, direct writes) runs
//! against the mainline checkout under the lead role.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::blueprint::Blueprint;
use crate::boundary::{ActorRole, BoundaryChecker};
use crate::bus::{event_types, EventBus};
use crate::conversation::{ConversationLoop, LoopError, LoopEvent, LoopFactory, LoopPurpose};
use crate::coordinator::ExecutionCoordinator;
use crate::plan::{Task, TaskStatus};
use crate::tools::{ChangeBuffer, ToolCallInput, ToolContext, ToolRegistry};
use crate::worktree::ChangeKind;

/// Tool name for plan mutations.
pub const PLAN_TOOL: &str = "plan.update";
/// Tool name for dispatching a worker and awaiting its result.
pub const DISPATCH_TOOL: &str = "worker.dispatch";

/// Cap on events per supervisor turn, as a runaway guard.
const MAX_TURN_EVENTS: usize = 2048;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Final report of a supervised run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadResult {
    pub success: bool,
    pub completed_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
    pub summary: String,
    pub duration_ms: u64,
}

/// One plan mutation requested through the plan tool. Applied immediately
/// to the coordinator's plan and appended to the operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanOp {
    AddTask {
        id: Option<String>,
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        dependencies: Vec<String>,
        #[serde(default)]
        module_id: Option<String>,
    },
    StartTask {
        task_id: String,
    },
    CompleteTask {
        task_id: String,
        #[serde(default)]
        summary: String,
    },
    FailTask {
        task_id: String,
        #[serde(default)]
        error: String,
    },
    SkipTask {
        task_id: String,
    },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{0}")]
    Loop(#[from] LoopError),
    #[error("supervisor conversation exceeded {MAX_TURN_EVENTS} events in one turn")]
    TurnOverrun,
    #[error("supervisor actor has terminated")]
    Terminated,
}

enum SupervisorCommand {
    Instruct {
        prompt: String,
        reply: oneshot::Sender<Result<String, SupervisorError>>,
    },
    Finish {
        reply: oneshot::Sender<LeadResult>,
    },
}

/// Client side of the supervisor actor.
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// Send an instruction as the next conversation turn and await the
    /// turn's final text.
    pub async fn instruct(&self, prompt: impl Into<String>) -> Result<String, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Instruct {
                prompt: prompt.into(),
                reply,
            })
            .await
            .map_err(|_| SupervisorError::Terminated)?;
        rx.await.map_err(|_| SupervisorError::Terminated)?
    }

    /// End the run and collect the result. Completed merges stay durable
    /// regardless of how the conversation ended.
    pub async fn finish(self) -> Result<LeadResult, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Finish { reply })
            .await
            .map_err(|_| SupervisorError::Terminated)?;
        rx.await.map_err(|_| SupervisorError::Terminated)
    }
}

// ---------------------------------------------------------------------------
// LeadSupervisor
// ---------------------------------------------------------------------------

pub struct LeadSupervisor {
    blueprint: Arc<Blueprint>,
    coordinator: ExecutionCoordinator,
    boundary: Arc<BoundaryChecker>,
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    convo: Box<dyn ConversationLoop>,
    oplog: Vec<PlanOp>,
    conversation_failed: Option<String>,
    last_summary: String,
}

impl LeadSupervisor {
    pub fn new(
        blueprint: Arc<Blueprint>,
        coordinator: ExecutionCoordinator,
        boundary: Arc<BoundaryChecker>,
        registry: Arc<ToolRegistry>,
        bus: Arc<EventBus>,
        loops: &dyn LoopFactory,
    ) -> Self {
        let convo = loops.open("lead", LoopPurpose::Supervision);
        Self {
            blueprint,
            coordinator,
            boundary,
            registry,
            bus,
            convo,
            oplog: Vec::new(),
            conversation_failed: None,
            last_summary: String::new(),
        }
    }

    /// Every plan mutation applied so far, in application order.
    pub fn oplog(&self) -> &[PlanOp] {
        &self.oplog
    }

    /// Start the actor. The conversation (and the run it owns) lives until
    /// `finish` is called on the handle.
    pub fn spawn(self) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(self.actor(rx));
        SupervisorHandle { tx }
    }

    /// Convenience: one instruction, then finish.
    pub async fn run(self, brief: impl Into<String>) -> Result<LeadResult, SupervisorError> {
        let handle = self.spawn();
        // A failed conversation still yields a partial result below.
        if let Err(error) = handle.instruct(brief).await {
            tracing::warn!("supervisor conversation failed: {error}");
        }
        handle.finish().await
    }

    async fn actor(mut self, mut rx: mpsc::Receiver<SupervisorCommand>) {
        let started = Instant::now();
        while let Some(command) = rx.recv().await {
            match command {
                SupervisorCommand::Instruct { prompt, reply } => {
                    let result = self.converse(&prompt).await;
                    if let Err(error) = &result {
                        self.conversation_failed = Some(error.to_string());
                    }
                    let _ = reply.send(result);
                }
                SupervisorCommand::Finish { reply } => {
                    let _ = reply.send(self.lead_result(started));
                    return;
                }
            }
        }
    }

    /// One full conversation turn: feed the prompt, execute tool calls as
    /// they arrive, return the turn's text.
    async fn converse(&mut self, prompt: &str) -> Result<String, SupervisorError> {
        let full_prompt = format!("{}\n\n{prompt}", self.role_brief());
        self.convo.start_turn(full_prompt).await?;

        let mut text = String::new();
        let mut events = 0usize;
        loop {
            events += 1;
            if events > MAX_TURN_EVENTS {
                return Err(SupervisorError::TurnOverrun);
            }
            match self.convo.next_event().await? {
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
                    let result = self.handle_tool(&tool_name, tool_input).await;
                    self.convo.submit_tool_result(&tool_name, result).await?;
                }
                LoopEvent::ToolEnd { .. } => {}
                LoopEvent::Done | LoopEvent::Interrupted => {
                    if !text.is_empty() {
                        self.last_summary = text.clone();
                    }
                    return Ok(text);
                }
            }
        }
    }

    /// Route one tool call. Tool failures come back as `Err(text)` into the
    /// conversation; they never abort the supervisor.
    async fn handle_tool(
        &mut self,
        tool_name: &str,
        tool_input: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        match tool_name {
            PLAN_TOOL => {
                let op: PlanOp = serde_json::from_value(tool_input)
                    .map_err(|e| format!("invalid plan operation: {e}"))?;
                self.apply_plan_op(op)
            }
            DISPATCH_TOOL => {
                let task_id = tool_input
                    .get("task_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "task_id required".to_string())?;
                let result = self
                    .coordinator
                    .dispatch_task(task_id)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(&result).map_err(|e| e.to_string())
            }
            _ => self.invoke_lead_tool(tool_name, tool_input),
        }
    }

    /// Apply a plan mutation, append it to the op log, and broadcast the
    /// new task state.
    fn apply_plan_op(&mut self, op: PlanOp) -> Result<serde_json::Value, String> {
        let applied_id = match &op {
            PlanOp::AddTask {
                id,
                name,
                description,
                dependencies,
                module_id,
            } => {
                let task_id = id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut task = Task::new(task_id.clone(), name.clone());
                task.description = description.clone();
                task.dependencies = dependencies.clone();
                task.module_id = module_id.clone();
                self.coordinator
                    .with_plan(|plan| plan.add_task(task))
                    .map_err(|e| e.to_string())?;
                task_id
            }
            PlanOp::StartTask { task_id } => {
                self.coordinator
                    .with_plan(|plan| {
                        let task = plan
                            .task_mut(task_id)
                            .ok_or_else(|| crate::plan::PlanError::UnknownTask(task_id.clone()))?;
                        task.advance(TaskStatus::Running)?;
                        Ok(())
                    })
                    .map_err(|e| e.to_string())?;
                task_id.clone()
            }
            PlanOp::CompleteTask { task_id, summary } => {
                self.settle_task(task_id, TaskStatus::Completed, summary.clone(), None)?;
                task_id.clone()
            }
            PlanOp::FailTask { task_id, error } => {
                self.settle_task(task_id, TaskStatus::Failed, String::new(), Some(error.clone()))?;
                task_id.clone()
            }
            PlanOp::SkipTask { task_id } => {
                self.coordinator
                    .with_plan(|plan| {
                        let task = plan
                            .task_mut(task_id)
                            .ok_or_else(|| crate::plan::PlanError::UnknownTask(task_id.clone()))?;
                        task.advance(TaskStatus::Skipped)
                    })
                    .map_err(|e| e.to_string())?;
                task_id.clone()
            }
        };
        self.oplog.push(op);
        self.coordinator.publish_task_update(&applied_id);
        Ok(serde_json::json!({ "ok": true, "taskId": applied_id }))
    }

    /// Terminal transition for a task the lead executed itself. A pending
    /// task is moved through `running` first so the status machine holds.
    fn settle_task(
        &self,
        task_id: &str,
        target: TaskStatus,
        summary: String,
        error: Option<String>,
    ) -> Result<(), String> {
        self.coordinator
            .with_plan(|plan| {
                let task = plan
                    .task_mut(task_id)
                    .ok_or_else(|| crate::plan::PlanError::UnknownTask(task_id.to_string()))?;
                if task.status == TaskStatus::Pending {
                    task.advance(TaskStatus::Running)?;
                }
                task.advance(target)?;
                task.result = Some(serde_json::json!({
                    "success": target == TaskStatus::Completed,
                    "summary": summary,
                    "error": error,
                    "executedBy": "lead",
                }));
                Ok(())
            })
            .map_err(|e| e.to_string())
    }

    /// Lead's direct tools run against the mainline checkout. Staged
    /// writes apply to disk immediately; the lead edits main in place.
    fn invoke_lead_tool(
        &self,
        tool_name: &str,
        tool_input: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let buffer = ChangeBuffer::new();
        let ctx = ToolContext {
            boundary: &self.boundary,
            role: ActorRole::Lead,
            module_id: None,
            worktree: &self.blueprint.project_path,
            buffer: Some(&buffer),
        };
        let output = self
            .registry
            .invoke(
                &ctx,
                ToolCallInput {
                    name: tool_name.to_string(),
                    args: tool_input,
                },
            )
            .map_err(|e| e.to_string())?;

        for change in buffer.drain() {
            let path = self.blueprint.project_path.join(&change.file_path);
            let applied = match change.kind {
                ChangeKind::Create | ChangeKind::Modify => path
                    .parent()
                    .map(std::fs::create_dir_all)
                    .transpose()
                    .and_then(|_| {
                        std::fs::write(&path, change.content.as_deref().unwrap_or(""))
                    }),
                ChangeKind::Delete => {
                    if path.exists() {
                        std::fs::remove_file(&path)
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(e) = applied {
                return Err(format!("lead write to {} failed: {e}", change.file_path));
            }
        }
        serde_json::to_value(&output).map_err(|e| e.to_string())
    }

    fn lead_result(&self, started: Instant) -> LeadResult {
        let plan = self.coordinator.plan_snapshot();
        let completed: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        let failed: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect();
        let success = self.conversation_failed.is_none() && failed.is_empty();
        let summary = match &self.conversation_failed {
            Some(error) => format!("supervisor conversation failed: {error}"),
            None if self.last_summary.is_empty() => {
                format!("{} task(s) completed, {} failed", completed.len(), failed.len())
            }
            None => self.last_summary.clone(),
        };
        let result = LeadResult {
            success,
            completed_task_ids: completed,
            failed_task_ids: failed,
            summary,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.bus.emit(
            event_types::PLAN_COMPLETED,
            Some(self.blueprint.id.clone()),
            serde_json::json!({
                "blueprintId": self.blueprint.id,
                "success": result.success,
                "durationMs": result.duration_ms,
            }),
        );
        result
    }

    fn role_brief(&self) -> String {
        format!(
            "You are the lead agent for project '{name}'. Explore the \
             repository, keep the task plan current with the {plan} tool, \
             classify each task as self-executed or dispatched, run \
             dispatched tasks with the {dispatch} tool, and integrate the \
             results. Worker results come back as tool results in this \
             conversation.",
            name = self.blueprint.name,
            plan = PLAN_TOOL,
            dispatch = DISPATCH_TOOL,
        )
    }
}
