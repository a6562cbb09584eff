//! Task plan data model: the DAG the coordinator executes.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Status machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether a task may move from `self` to `to` on the normal (forward)
    /// path. Retry and restart recovery go through [`Task::reset_for_retry`]
    /// instead; they are the only sanctioned backward moves.
    pub fn can_advance(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Skipped)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("unknown task status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Medium
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One node of the plan DAG plus its execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub complexity: Complexity,
    /// Free-form task kind, e.g. "feature", "test", "refactor".
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Files the task is expected to touch, advisory.
    #[serde(default)]
    pub files: Vec<String>,
    /// Ids of tasks that must be terminal-successful before this one runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Module binding for the boundary checker, if any.
    #[serde(default)]
    pub module_id: Option<String>,

    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_worker_id: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    /// Serialized `TaskResult` from the last attempt.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            complexity: Complexity::default(),
            kind: String::new(),
            files: Vec::new(),
            dependencies: Vec::new(),
            module_id: None,
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            assigned_worker_id: None,
            branch_name: None,
            worktree_path: None,
            result: None,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        self
    }

    /// Forward status transition. Rejects anything the state machine does
    /// not allow, so a stale caller cannot un-complete a task.
    pub fn advance(&mut self, to: TaskStatus) -> Result<(), PlanError> {
        if !self.status.can_advance(to) {
            return Err(PlanError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        match to {
            TaskStatus::Running => {
                self.started_at = Some(Utc::now());
                self.attempts += 1;
            }
            _ if to.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Explicit retry / restart-recovery reset: `running | failed | skipped`
    /// back to `pending`. The only backward move the status machine allows;
    /// the attempt counter advances when the task next enters `running`.
    pub fn reset_for_retry(&mut self) -> Result<(), PlanError> {
        match self.status {
            TaskStatus::Running | TaskStatus::Failed | TaskStatus::Skipped => {
                self.status = TaskStatus::Pending;
                self.assigned_worker_id = None;
                self.started_at = None;
                self.completed_at = None;
                self.result = None;
                Ok(())
            }
            from => Err(PlanError::InvalidTransition {
                task_id: self.id.clone(),
                from,
                to: TaskStatus::Pending,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

/// The task DAG derived from a blueprint, plus its topological layering.
///
/// `parallel_groups[i]` depends only on tasks in groups `< i`; tasks within
/// a group are mutually independent (invariant P1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: String,
    pub blueprint_id: String,
    pub tasks: Vec<Task>,
    pub parallel_groups: Vec<Vec<String>>,
    pub status: PlanStatus,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionPlan {
    /// Build a plan from tasks, computing the topological layering. Fails
    /// on unknown dependencies or cycles.
    pub fn new(blueprint_id: impl Into<String>, tasks: Vec<Task>) -> Result<Self, PlanError> {
        let parallel_groups = compute_parallel_groups(&tasks)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            blueprint_id: blueprint_id.into(),
            tasks,
            parallel_groups,
            status: PlanStatus::Pending,
            estimated_cost: None,
            estimated_minutes: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Append a task whose declared dependencies must already exist
    /// (invariant P1 for dynamic additions), then re-layer.
    pub fn add_task(&mut self, task: Task) -> Result<(), PlanError> {
        if self.task(&task.id).is_some() {
            return Err(PlanError::DuplicateTask(task.id));
        }
        for dep in &task.dependencies {
            if self.task(dep).is_none() {
                return Err(PlanError::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        self.tasks.push(task);
        self.parallel_groups = compute_parallel_groups(&self.tasks)?;
        Ok(())
    }

    /// Current progress snapshot.
    pub fn stats(&self) -> ExecutionStats {
        let mut stats = ExecutionStats {
            total_tasks: self.tasks.len(),
            ..ExecutionStats::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Skipped => stats.skipped += 1,
            }
        }
        if stats.total_tasks > 0 {
            let done = stats.completed + stats.failed + stats.skipped;
            stats.progress_pct = (done as f64 / stats.total_tasks as f64 * 100.0).round();
        }
        stats
    }

    /// All tasks are in a terminal state.
    pub fn is_settled(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }
}

/// Aggregate counters published as `stats:update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_tasks: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub progress_pct: f64,
}

// ---------------------------------------------------------------------------
// DAG utilities
// ---------------------------------------------------------------------------

/// Kahn layering: group 0 holds tasks with no dependencies, group i+1 holds
/// tasks whose dependencies all sit in groups <= i. Preserves input order
/// within a group so layering is deterministic.
pub fn compute_parallel_groups(tasks: &[Task]) -> Result<Vec<Vec<String>>, PlanError> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut remaining: VecDeque<&Task> = tasks.iter().collect();
    let mut stalled = 0usize;
    while let Some(task) = remaining.pop_front() {
        let resolved: Option<usize> = task
            .dependencies
            .iter()
            .map(|d| depth.get(d.as_str()).copied())
            .try_fold(0usize, |acc, d| d.map(|d| acc.max(d + 1)));
        match resolved {
            Some(layer) => {
                depth.insert(task.id.as_str(), layer);
                stalled = 0;
            }
            None => {
                remaining.push_back(task);
                stalled += 1;
                if stalled > remaining.len() {
                    let cycle: Vec<String> =
                        remaining.iter().map(|t| t.id.clone()).collect();
                    return Err(PlanError::DependencyCycle(cycle));
                }
            }
        }
    }

    let max_depth = depth.values().copied().max().map_or(0, |d| d + 1);
    let mut groups: Vec<Vec<String>> = vec![Vec::new(); max_depth];
    for task in tasks {
        groups[depth[task.id.as_str()]].push(task.id.clone());
    }
    Ok(groups)
}

/// Ids of every task that transitively depends on any id in `roots`.
/// Used to skip dependents of a failed task.
pub fn transitive_dependents(tasks: &[Task], roots: &[&str]) -> HashSet<String> {
    let mut affected: HashSet<String> = roots.iter().map(|r| (*r).to_string()).collect();
    // Worst case one pass per DAG level.
    loop {
        let mut changed = false;
        for task in tasks {
            if affected.contains(&task.id) {
                continue;
            }
            if task.dependencies.iter().any(|d| affected.contains(d)) {
                affected.insert(task.id.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    for root in roots {
        affected.remove(*root);
    }
    affected
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("task {task_id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },
    #[error("dependency cycle involving tasks: {0:?}")]
    DependencyCycle(Vec<String>),
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),
    #[error("unknown task id: {0}")]
    UnknownTask(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
