//! Cross-module integration tests.
//!
//! These drive real scratch git repositories through scripted conversation
//! loops: workers explore, stage writes, commit to their branches, and the
//! controller merges everything back under the git mutex.

mod pipeline;

use std::sync::Arc;

use tempfile::TempDir;

use crate::blueprint::Blueprint;
use crate::boundary::BoundaryChecker;
use crate::bus::{EventBus, SubscriptionFilter, Subscription};
use crate::config::SwarmConfig;
use crate::conversation::{LoopPurpose, ScriptedLoopFactory, ScriptedStep, ScriptedTurn};
use crate::coordinator::ExecutionCoordinator;
use crate::lock::GitLock;
use crate::plan::{ExecutionPlan, Task};
use crate::testing::{init_git_repo, temp_workspace};
use crate::tools::ToolRegistry;
use crate::worktree::WorktreeController;

/// Everything a scenario needs, wired the way an embedder would.
pub(crate) struct Harness {
    pub ws: TempDir,
    pub blueprint: Arc<Blueprint>,
    pub bus: Arc<EventBus>,
    pub lock: Arc<GitLock>,
    pub controller: Arc<WorktreeController>,
    pub boundary: Arc<BoundaryChecker>,
    pub registry: Arc<ToolRegistry>,
    pub factory: Arc<ScriptedLoopFactory>,
}

impl Harness {
    pub fn new() -> Self {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        let blueprint = Arc::new(Blueprint::new("integration", ws.path()));
        let bus = Arc::new(EventBus::new());
        let lock = Arc::new(GitLock::new());
        let controller = Arc::new(
            WorktreeController::open(
                ws.path().to_path_buf(),
                lock.clone(),
                bus.clone(),
                Some(blueprint.id.clone()),
            )
            .expect("controller open failed"),
        );
        // Opening the controller appended the worktree root to .gitignore;
        // commit it so scenarios start from a clean main tree.
        crate::testing::commit_all(ws.path(), "ignore worktree root");
        let boundary = Arc::new(BoundaryChecker::new(&blueprint));
        Self {
            ws,
            blueprint,
            bus,
            lock,
            controller,
            boundary,
            registry: Arc::new(ToolRegistry::standard()),
            factory: Arc::new(ScriptedLoopFactory::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(SubscriptionFilter::all())
    }

    pub fn coordinator(&self, config: SwarmConfig, tasks: Vec<Task>) -> ExecutionCoordinator {
        let plan = ExecutionPlan::new(self.blueprint.id.clone(), tasks).expect("plan build failed");
        ExecutionCoordinator::new(
            config,
            self.blueprint.clone(),
            plan,
            self.controller.clone(),
            self.boundary.clone(),
            self.registry.clone(),
            self.factory.clone(),
            self.bus.clone(),
            self.lock.clone(),
        )
    }

    /// Script a worker that analyzes, decides, writes the given files, and
    /// completes.
    pub fn script_worker_success(&self, task_id: &str, files: &[(&str, &str)]) {
        self.factory.register(
            task_id,
            LoopPurpose::Analysis,
            vec![
                ScriptedTurn::text(format!("analyzed workspace for {task_id}")),
                ScriptedTurn::text(
                    r#"{"shouldWriteTests": false, "testReason": "covered elsewhere", "steps": ["apply the edit"], "estimatedMinutes": 1}"#,
                ),
            ],
        );
        let mut steps: Vec<ScriptedStep> = files
            .iter()
            .map(|(path, content)| ScriptedStep::Tool {
                name: "fs.write".into(),
                input: serde_json::json!({"path": path, "content": content}),
            })
            .collect();
        steps.push(ScriptedStep::Text(format!("finished {task_id}")));
        self.factory
            .register(task_id, LoopPurpose::Execution, vec![ScriptedTurn::steps(steps)]);
    }

    /// Script a worker whose conversation dies immediately.
    pub fn script_worker_failure(&self, task_id: &str, message: &str) {
        self.factory.register(
            task_id,
            LoopPurpose::Analysis,
            vec![ScriptedTurn::steps(vec![ScriptedStep::Fail(
                message.to_string(),
            )])],
        );
    }

    /// Script a worker whose conversation hangs forever.
    pub fn script_worker_hang(&self, task_id: &str) {
        self.factory.register(
            task_id,
            LoopPurpose::Analysis,
            vec![ScriptedTurn::steps(vec![ScriptedStep::Hang])],
        );
    }

    /// Live `swarm/worker-*` branches in the repo.
    pub fn swarm_branches(&self) -> Vec<String> {
        let output = std::process::Command::new("git")
            .args(["branch", "--list", "swarm/*", "--format=%(refname:short)"])
            .current_dir(self.ws.path())
            .output()
            .expect("git branch failed");
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Worker directories still present under the worktree root.
    pub fn worktree_dirs(&self) -> Vec<String> {
        let root = self.ws.path().join(crate::worktree::WORKTREE_ROOT_DIR);
        match std::fs::read_dir(root) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
