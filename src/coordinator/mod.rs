//! Execution coordinator: drives an [`ExecutionPlan`] to completion.
//!
//! Scheduling is wave-based over the plan's topological layering. Within a
//! wave, tasks dispatch as worker slots free up (bounded by `max_workers`);
//! a wave must settle before the next one starts. Merges queue behind the
//! git mutex, and when that queue backs up past the configured threshold no
//! new workers start until it drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use crate::blueprint::Blueprint;
use crate::boundary::BoundaryChecker;
use crate::bus::{event_types, EventBus};
use crate::config::SwarmConfig;
use crate::conversation::LoopFactory;
use crate::lock::GitLock;
use crate::plan::{
    transitive_dependents, ExecutionPlan, ExecutionStats, PlanError, PlanStatus, TaskStatus,
};
use crate::tools::ToolRegistry;
use crate::worker::{CancelToken, TaskResult, WorkerAgent, WorkerRequest};
use crate::worktree::{WorktreeController, WorktreeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("{0}")]
    Plan(#[from] PlanError),
    #[error("{0}")]
    Worktree(#[from] WorktreeError),
    #[error("unknown task: {0}")]
    TaskNotFound(String),
    #[error("execution was stopped")]
    Stopped,
    #[error("merges are halted pending operator intervention")]
    MergesHalted,
}

/// Owns the plan for the duration of a run. Cheap to clone (all state is
/// shared behind `Arc`); workers and the supervisor reach the plan only
/// through this type, so plan mutation stays serialized.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    config: SwarmConfig,
    blueprint: Arc<Blueprint>,
    plan: Arc<Mutex<ExecutionPlan>>,
    controller: Arc<WorktreeController>,
    boundary: Arc<BoundaryChecker>,
    registry: Arc<ToolRegistry>,
    loops: Arc<dyn LoopFactory>,
    bus: Arc<EventBus>,
    lock: Arc<GitLock>,
    slots: Arc<Semaphore>,
    control_tx: Arc<watch::Sender<ControlState>>,
    control_rx: watch::Receiver<ControlState>,
    cancels: Arc<DashMap<String, CancelToken>>,
    merges_halted: Arc<AtomicBool>,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SwarmConfig,
        blueprint: Arc<Blueprint>,
        plan: ExecutionPlan,
        controller: Arc<WorktreeController>,
        boundary: Arc<BoundaryChecker>,
        registry: Arc<ToolRegistry>,
        loops: Arc<dyn LoopFactory>,
        bus: Arc<EventBus>,
        lock: Arc<GitLock>,
    ) -> Self {
        let (control_tx, control_rx) = watch::channel(ControlState::Running);
        let slots = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            config,
            blueprint,
            plan: Arc::new(Mutex::new(plan)),
            controller,
            boundary,
            registry,
            loops,
            bus,
            lock,
            slots,
            control_tx: Arc::new(control_tx),
            control_rx,
            cancels: Arc::new(DashMap::new()),
            merges_halted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn plan_snapshot(&self) -> ExecutionPlan {
        self.plan.lock().expect("plan mutex poisoned").clone()
    }

    pub fn stats(&self) -> ExecutionStats {
        self.plan.lock().expect("plan mutex poisoned").stats()
    }

    fn blueprint_id(&self) -> Option<String> {
        Some(self.blueprint.id.clone())
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    /// Stop selecting new waves; in-flight workers finish.
    pub fn pause(&self) {
        if self.control_tx.send(ControlState::Paused).is_ok() {
            self.plan.lock().expect("plan mutex poisoned").status = PlanStatus::Paused;
            self.bus.emit(
                event_types::EXECUTION_PAUSED,
                self.blueprint_id(),
                serde_json::json!({"blueprintId": self.blueprint.id}),
            );
        }
    }

    /// Continue from the first non-terminal wave.
    pub fn resume(&self) {
        if self.control_tx.send(ControlState::Running).is_ok() {
            self.plan.lock().expect("plan mutex poisoned").status = PlanStatus::Running;
            self.bus.emit(
                event_types::EXECUTION_RESUMED,
                self.blueprint_id(),
                serde_json::json!({"blueprintId": self.blueprint.id}),
            );
        }
    }

    /// Cancel all in-flight workers and end the run.
    pub fn stop(&self) {
        let _ = self.control_tx.send(ControlState::Stopped);
        for entry in self.cancels.iter() {
            entry.value().cancel();
        }
    }

    /// Reset a `failed` or `skipped` task to `pending`. If its dependencies
    /// are already satisfied it is scheduled immediately; if they have
    /// since failed it resolves straight to `skipped`; otherwise the next
    /// wave picks it up.
    pub fn retry(&self, task_id: &str) -> Result<(), CoordinatorError> {
        let ready = {
            let mut plan = self.plan.lock().expect("plan mutex poisoned");
            let task = plan
                .task(task_id)
                .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::Skipped) {
                return Err(CoordinatorError::Plan(PlanError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status,
                    to: TaskStatus::Pending,
                }));
            }
            let deps = task.dependencies.clone();
            let dep_states: Vec<TaskStatus> = deps
                .iter()
                .filter_map(|d| plan.task(d).map(|t| t.status))
                .collect();
            let task = plan
                .task_mut(task_id)
                .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
            task.reset_for_retry()?;

            if dep_states
                .iter()
                .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::Skipped))
            {
                // Precondition unsatisfied: dependencies are lost for good.
                task.advance(TaskStatus::Skipped)?;
                false
            } else {
                dep_states.iter().all(|s| *s == TaskStatus::Completed)
            }
        };
        self.emit_task_update(task_id);

        if ready {
            let coordinator = self.clone();
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                if let Err(error) = coordinator.dispatch_task(&task_id).await {
                    tracing::warn!("retry dispatch of {task_id} failed: {error}");
                }
            });
        }
        Ok(())
    }

    /// Restart recovery: any task recorded `running` goes back to
    /// `pending`, and workspaces found on disk are destroyed so
    /// rescheduling starts from a clean tree.
    pub fn recover(&self) -> Result<(), CoordinatorError> {
        let running: Vec<String> = {
            let mut plan = self.plan.lock().expect("plan mutex poisoned");
            let ids: Vec<String> = plan
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Running)
                .map(|t| t.id.clone())
                .collect();
            for id in &ids {
                if let Some(task) = plan.task_mut(id) {
                    task.reset_for_retry()?;
                    task.branch_name = None;
                    task.worktree_path = None;
                }
            }
            ids
        };
        for id in &running {
            self.emit_task_update(id);
        }
        for workspace in self.controller.list_workspaces() {
            self.controller.destroy_workspace(&workspace.worker_id)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Core loop
    // -----------------------------------------------------------------------

    /// Run the plan to a terminal state.
    pub async fn run(&self) -> Result<ExecutionStats, CoordinatorError> {
        let started = Instant::now();
        let total_tasks = {
            let mut plan = self.plan.lock().expect("plan mutex poisoned");
            plan.status = PlanStatus::Running;
            plan.started_at = Some(chrono::Utc::now());
            plan.tasks.len()
        };
        self.bus.emit(
            event_types::PLAN_STARTED,
            self.blueprint_id(),
            serde_json::json!({
                "blueprintId": self.blueprint.id,
                "totalTasks": total_tasks,
            }),
        );

        let mut halted = false;
        let mut group_index = 0usize;
        loop {
            if self.wait_while_paused().await {
                break; // stopped
            }
            let group = {
                let plan = self.plan.lock().expect("plan mutex poisoned");
                // Groups can grow while running (supervisor additions).
                plan.parallel_groups.get(group_index).cloned()
            };
            let Some(group) = group else {
                // Past the last wave: pick up anything reset by retries.
                let stragglers = self.select_ready_pending();
                if stragglers.is_empty() {
                    break;
                }
                self.run_wave(&stragglers).await;
                continue;
            };
            group_index += 1;

            let wave = self.select_wave(&group);
            if wave.is_empty() {
                continue;
            }
            self.run_wave(&wave).await;
            self.emit_stats();

            if !self.config.skip_on_failure && self.any_failed() {
                halted = true;
                break;
            }
        }

        let stopped = *self.control_rx.borrow() == ControlState::Stopped;
        let stats = {
            let mut plan = self.plan.lock().expect("plan mutex poisoned");
            plan.completed_at = Some(chrono::Utc::now());
            let stats = plan.stats();
            plan.status = if stats.failed == 0 && !stopped && !halted {
                PlanStatus::Completed
            } else {
                PlanStatus::Failed
            };
            stats
        };
        let success = stats.failed == 0 && !stopped && !halted;
        self.bus.emit(
            event_types::PLAN_COMPLETED,
            self.blueprint_id(),
            serde_json::json!({
                "blueprintId": self.blueprint.id,
                "success": success,
                "durationMs": started.elapsed().as_millis() as u64,
            }),
        );
        self.bus.emit(
            event_types::EXECUTION_COMPLETED,
            self.blueprint_id(),
            serde_json::json!({
                "blueprintId": self.blueprint.id,
                "success": success,
            }),
        );
        Ok(stats)
    }

    /// Run one specific task to its terminal state, respecting worker
    /// slots and merge backpressure. This is also the path behind the
    /// supervisor's dispatch tool.
    pub async fn dispatch_task(&self, task_id: &str) -> Result<TaskResult, CoordinatorError> {
        // Merge-queue backpressure gate: do not create new workers while
        // the mutex queue is saturated or merging is halted.
        loop {
            if *self.control_rx.borrow() == ControlState::Stopped {
                return Err(CoordinatorError::Stopped);
            }
            if self.merges_halted.load(Ordering::SeqCst) {
                return Err(CoordinatorError::MergesHalted);
            }
            if self.lock.waiters() < self.config.merge_queue_backpressure_threshold {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoordinatorError::Stopped)?;

        let worker_id = Uuid::new_v4().to_string();
        let request = self.start_task(task_id, &worker_id)?;
        self.emit_task_update(task_id);

        // Workspace first; creation failure is terminal before any tool runs.
        let workspace = match self.controller.create_workspace(&worker_id).await {
            Ok(workspace) => workspace,
            Err(error) => {
                let result = TaskResult::failure(format!("workspace creation failed: {error}"));
                self.finish_task(task_id, &result, false);
                drop(permit);
                return Ok(result);
            }
        };
        {
            let mut plan = self.plan.lock().expect("plan mutex poisoned");
            if let Some(task) = plan.task_mut(task_id) {
                task.branch_name = Some(workspace.branch_name.clone());
                task.worktree_path = Some(workspace.worktree_path.to_string_lossy().to_string());
            }
        }
        self.bus.emit(
            event_types::WORKER_CREATED,
            self.blueprint_id(),
            serde_json::json!({
                "workerId": worker_id,
                "taskId": task_id,
                "branchName": workspace.branch_name,
                "worktreePath": workspace.worktree_path,
            }),
        );

        let cancel = CancelToken::new();
        self.cancels.insert(task_id.to_string(), cancel.clone());
        let agent = WorkerAgent::new(
            worker_id.clone(),
            request,
            workspace,
            self.controller.clone(),
            self.boundary.clone(),
            self.registry.clone(),
            self.loops.clone(),
            self.bus.clone(),
            self.blueprint_id(),
            cancel.clone(),
        );

        // Race the worker against its wall-clock budget and against an
        // external stop. A worker whose backend hangs yields to either.
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.config.worker_timeout(), agent.run()) => Some(result),
            _ = cancel.cancelled() => None,
        };
        self.cancels.remove(task_id);

        let result = match outcome {
            None => {
                if let Err(error) = self.controller.destroy_workspace(&worker_id) {
                    tracing::warn!("workspace cleanup after cancel failed: {error}");
                }
                let result = TaskResult::failure("cancelled");
                self.finish_task(task_id, &result, false);
                result
            }
            Some(Err(_elapsed)) => {
                cancel.cancel();
                if let Err(error) = self.controller.destroy_workspace(&worker_id) {
                    tracing::warn!("workspace cleanup after timeout failed: {error}");
                }
                let result = TaskResult::failure("timeout");
                self.finish_task(task_id, &result, false);
                result
            }
            Some(Ok(result)) if result.success => {
                self.merge_and_finish(task_id, &worker_id, result).await
            }
            Some(Ok(result)) => {
                // Worker failed; cancelled workers already tore down their
                // workspace, everything else is cleared here.
                if self.controller.workspace(&worker_id).is_some() {
                    if let Err(error) = self.controller.destroy_workspace(&worker_id) {
                        tracing::warn!("workspace cleanup after failure failed: {error}");
                    }
                }
                self.finish_task(task_id, &result, false);
                result
            }
        };

        drop(permit);
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn merge_and_finish(
        &self,
        task_id: &str,
        worker_id: &str,
        mut result: TaskResult,
    ) -> TaskResult {
        if self.merges_halted.load(Ordering::SeqCst) {
            result = TaskResult::failure("merge queue halted pending operator intervention");
            self.finish_task(task_id, &result, false);
            return result;
        }
        match self.controller.merge_workspace(worker_id).await {
            Ok(outcome) if outcome.merged => {
                self.finish_task(task_id, &result, true);
                result
            }
            Ok(outcome) => {
                // Unresolvable conflict: non-fatal to the pipeline, the
                // task needs a human.
                let mut failed = TaskResult::failure(outcome.message.clone());
                failed.summary = outcome
                    .conflict
                    .as_ref()
                    .map(|c| c.description.clone())
                    .unwrap_or(outcome.message);
                self.finish_task_with_review(task_id, &failed);
                failed
            }
            Err(WorktreeError::RepositoryUnrecoverable(message)) => {
                // Fatal to the merge pipeline: stop dispatching merges and
                // pause the plan until an operator intervenes.
                self.merges_halted.store(true, Ordering::SeqCst);
                self.bus.emit(
                    event_types::EXECUTION_ERROR,
                    self.blueprint_id(),
                    serde_json::json!({
                        "blueprintId": self.blueprint.id,
                        "error": &message,
                    }),
                );
                self.pause();
                let result = TaskResult::failure(message);
                self.finish_task(task_id, &result, false);
                result
            }
            Err(error) => {
                let result = TaskResult::failure(error.to_string());
                self.finish_task(task_id, &result, false);
                result
            }
        }
    }

    /// Mark skips for tasks whose dependencies are lost, then return the
    /// still-runnable subset of the group.
    fn select_wave(&self, group: &[String]) -> Vec<String> {
        let skipped: Vec<String> = {
            let mut plan = self.plan.lock().expect("plan mutex poisoned");
            let lost_roots: Vec<String> = plan
                .tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
                .map(|t| t.id.clone())
                .collect();
            let root_refs: Vec<&str> = lost_roots.iter().map(String::as_str).collect();
            let doomed = transitive_dependents(&plan.tasks, &root_refs);
            let mut skipped = Vec::new();
            for id in group {
                let Some(task) = plan.task_mut(id) else { continue };
                if task.status == TaskStatus::Pending
                    && doomed.contains(id)
                    && task.advance(TaskStatus::Skipped).is_ok()
                {
                    skipped.push(id.clone());
                }
            }
            skipped
        };
        for id in &skipped {
            self.emit_task_update(id);
        }
        self.plan
            .lock()
            .expect("plan mutex poisoned")
            .tasks
            .iter()
            .filter(|t| group.contains(&t.id) && t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Pending tasks whose dependencies are all settled successfully
    /// (retry stragglers after the last wave).
    fn select_ready_pending(&self) -> Vec<String> {
        let plan = self.plan.lock().expect("plan mutex poisoned");
        plan.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependencies.iter().all(|d| {
                    plan.task(d)
                        .map(|dep| {
                            matches!(dep.status, TaskStatus::Completed | TaskStatus::Skipped)
                        })
                        .unwrap_or(false)
                })
            })
            .map(|t| t.id.clone())
            .collect()
    }

    async fn run_wave(&self, wave: &[String]) {
        let mut handles = Vec::with_capacity(wave.len());
        for task_id in wave {
            let coordinator = self.clone();
            let task_id = task_id.clone();
            handles.push(tokio::spawn(async move {
                match coordinator.dispatch_task(&task_id).await {
                    Ok(_) | Err(CoordinatorError::Stopped) => {}
                    Err(error) => {
                        tracing::warn!("dispatch of {task_id} failed: {error}");
                        coordinator.finish_task(
                            &task_id,
                            &TaskResult::failure(error.to_string()),
                            false,
                        );
                    }
                }
            }));
        }
        futures::future::join_all(handles).await;
    }

    fn start_task(&self, task_id: &str, worker_id: &str) -> Result<WorkerRequest, CoordinatorError> {
        let mut plan = self.plan.lock().expect("plan mutex poisoned");
        let blueprint = &self.blueprint;
        let config = &self.config;
        let task = plan
            .task_mut(task_id)
            .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
        task.advance(TaskStatus::Running)?;
        task.assigned_worker_id = Some(worker_id.to_string());
        Ok(WorkerRequest {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            description: task.description.clone(),
            brief: format!("{}\n\n{}", blueprint.description, task.description),
            target_files: task.files.clone(),
            constraints: blueprint.constraints.clone(),
            module_id: task.module_id.clone(),
            model: config.model_for(task.complexity).to_string(),
        })
    }

    fn finish_task(&self, task_id: &str, result: &TaskResult, success: bool) {
        {
            let mut plan = self.plan.lock().expect("plan mutex poisoned");
            if let Some(task) = plan.task_mut(task_id) {
                let target = if success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                if task.status == TaskStatus::Running {
                    if let Err(error) = task.advance(target) {
                        tracing::warn!("status update for {task_id} rejected: {error}");
                    }
                }
                task.result = serde_json::to_value(result).ok();
            }
        }
        self.emit_task_update(task_id);
        self.emit_stats();
    }

    fn finish_task_with_review(&self, task_id: &str, result: &TaskResult) {
        {
            let mut plan = self.plan.lock().expect("plan mutex poisoned");
            if let Some(task) = plan.task_mut(task_id) {
                if task.status == TaskStatus::Running {
                    if let Err(error) = task.advance(TaskStatus::Failed) {
                        tracing::warn!("status update for {task_id} rejected: {error}");
                    }
                }
                let mut value = serde_json::to_value(result).unwrap_or_default();
                if let Some(object) = value.as_object_mut() {
                    object.insert("needsHumanReview".to_string(), serde_json::json!(true));
                }
                task.result = Some(value);
            }
        }
        self.emit_task_update(task_id);
        self.emit_stats();
    }

    fn any_failed(&self) -> bool {
        self.plan
            .lock()
            .expect("plan mutex poisoned")
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Failed)
    }

    /// Returns true if the run was stopped.
    async fn wait_while_paused(&self) -> bool {
        let mut rx = self.control_rx.clone();
        loop {
            let state = *rx.borrow();
            match state {
                ControlState::Running => return false,
                ControlState::Stopped => return true,
                ControlState::Paused => {
                    if rx.changed().await.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    fn emit_task_update(&self, task_id: &str) {
        let payload = {
            let plan = self.plan.lock().expect("plan mutex poisoned");
            plan.task(task_id).map(|task| {
                serde_json::json!({
                    "taskId": task.id,
                    "status": task.status,
                    "attempts": task.attempts,
                    "assignedWorkerId": task.assigned_worker_id,
                    "error": task
                        .result
                        .as_ref()
                        .and_then(|r| r.get("error"))
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                })
            })
        };
        if let Some(payload) = payload {
            self.bus.emit(event_types::TASK_UPDATE, self.blueprint_id(), payload);
        }
    }

    fn emit_stats(&self) {
        let stats = self.stats();
        self.bus.emit(
            event_types::STATS_UPDATE,
            self.blueprint_id(),
            serde_json::to_value(&stats).unwrap_or_default(),
        );
    }

    // -----------------------------------------------------------------------
    // Plan mutation surface for the supervisor
    // -----------------------------------------------------------------------

    /// Apply a plan mutation on behalf of the supervisor's plan tool.
    pub fn with_plan<T>(
        &self,
        f: impl FnOnce(&mut ExecutionPlan) -> Result<T, PlanError>,
    ) -> Result<T, PlanError> {
        let mut plan = self.plan.lock().expect("plan mutex poisoned");
        f(&mut plan)
    }

    /// Emit the current state of `task_id` (used after external mutations).
    pub fn publish_task_update(&self, task_id: &str) {
        self.emit_task_update(task_id);
    }
}
