//! End-to-end worktree pipeline scenarios.

use std::time::Duration;

use crate::bus::event_types;
use crate::config::SwarmConfig;
use crate::plan::{Task, TaskStatus};
use crate::testing::{commit_all, log_subjects};
use crate::worktree::{ChangeKind, FileChange};

use super::Harness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_independent_workers_both_land_on_main() {
    let h = Harness::new();
    let sub = h.subscribe();
    h.script_worker_success("task-a", &[("src/a.ts", "export const a = 1;\n")]);
    h.script_worker_success("task-b", &[("src/b.ts", "export const b = 2;\n")]);

    let coordinator = h.coordinator(
        SwarmConfig::default(),
        vec![Task::new("task-a", "add a"), Task::new("task-b", "add b")],
    );
    let stats = coordinator.run().await.unwrap();

    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
    assert!(h.ws.path().join("src/a.ts").exists());
    assert!(h.ws.path().join("src/b.ts").exists());

    // Two [Swarm] commits landed on main.
    let swarm_commits: Vec<String> = log_subjects(h.ws.path())
        .into_iter()
        .filter(|s| s.starts_with("[Swarm]") && s.contains("Files:"))
        .collect();
    assert_eq!(swarm_commits.len(), 2);

    // Branches and worktree directories are gone.
    assert!(h.swarm_branches().is_empty());
    assert!(h.worktree_dirs().is_empty());

    // Event trail covers the whole lifecycle, and the final stats report
    // both tasks completed.
    let events = sub.drain();
    let merge_successes = events
        .iter()
        .filter(|e| e.event_type == event_types::MERGE_SUCCESS)
        .count();
    assert_eq!(merge_successes, 2);
    let last_stats = events
        .iter()
        .rev()
        .find(|e| e.event_type == event_types::STATS_UPDATE)
        .expect("stats:update missing");
    assert_eq!(last_stats.payload["completed"], 2);
}

/// Benign conflict on an import block: rule 4 unions and sorts the
/// imports, and the second merge completes with a resolution commit.
#[tokio::test]
async fn import_block_conflict_auto_resolves() {
    let h = Harness::new();
    let sub = h.subscribe();
    let base = "console.log('app');\n";
    std::fs::write(h.ws.path().join("index.ts"), base).unwrap();
    commit_all(h.ws.path(), "add entrypoint");

    // Both workspaces branch from the same main.
    h.controller.create_workspace("worker-a").await.unwrap();
    h.controller.create_workspace("worker-b").await.unwrap();

    h.controller
        .apply_changes(
            "worker-a",
            &[FileChange {
                file_path: "index.ts".into(),
                kind: ChangeKind::Modify,
                content: Some(format!("import X from 'x';\n{base}")),
            }],
            "add x import",
        )
        .unwrap();
    h.controller
        .apply_changes(
            "worker-b",
            &[FileChange {
                file_path: "index.ts".into(),
                kind: ChangeKind::Modify,
                content: Some(format!("import Y from 'y';\n{base}")),
            }],
            "add y import",
        )
        .unwrap();

    let first = h.controller.merge_workspace("worker-a").await.unwrap();
    assert!(first.merged);
    assert!(!first.auto_resolved);

    let second = h.controller.merge_workspace("worker-b").await.unwrap();
    assert!(second.merged);
    assert!(second.auto_resolved);

    let content = std::fs::read_to_string(h.ws.path().join("index.ts")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "import X from 'x';");
    assert_eq!(lines[1], "import Y from 'y';");
    assert!(content.contains("console.log('app');"));

    let subjects = log_subjects(h.ws.path());
    assert!(subjects
        .iter()
        .any(|s| s.contains("Auto-resolved merge conflict for worker-b")));

    let auto_resolved_events: Vec<bool> = sub
        .drain()
        .into_iter()
        .filter(|e| e.event_type == event_types::MERGE_SUCCESS)
        .map(|e| e.payload["autoResolved"].as_bool().unwrap_or(false))
        .collect();
    assert_eq!(auto_resolved_events, vec![false, true]);
}

/// Divergent rewrites of the same body are not auto-resolvable: the merge
/// aborts, the repo stays clean, and the outcome demands a human.
#[tokio::test]
async fn unresolvable_conflict_aborts_and_flags_review() {
    let h = Harness::new();
    let sub = h.subscribe();
    std::fs::write(h.ws.path().join("calc.ts"), "function f() { return 0; }\n").unwrap();
    commit_all(h.ws.path(), "add calc");

    h.controller.create_workspace("worker-a").await.unwrap();
    h.controller.create_workspace("worker-b").await.unwrap();

    h.controller
        .apply_changes(
            "worker-a",
            &[FileChange {
                file_path: "calc.ts".into(),
                kind: ChangeKind::Modify,
                content: Some("function f() { return 1 + 2; }\n".into()),
            }],
            "rewrite f",
        )
        .unwrap();
    h.controller
        .apply_changes(
            "worker-b",
            &[FileChange {
                file_path: "calc.ts".into(),
                kind: ChangeKind::Modify,
                content: Some("function f() { return 40 * 2; }\n".into()),
            }],
            "rewrite f differently",
        )
        .unwrap();

    let first = h.controller.merge_workspace("worker-a").await.unwrap();
    assert!(first.merged);

    let second = h.controller.merge_workspace("worker-b").await.unwrap();
    assert!(!second.merged);
    assert!(second.needs_human_review);
    let conflict = second.conflict.expect("conflict info missing");
    assert_eq!(conflict.files, vec!["calc.ts".to_string()]);

    // Main is clean, on main, no merge in progress, and holds A's version.
    let git = crate::worktree::GitClient::new();
    assert!(!git.merge_in_progress(h.ws.path()));
    assert!(git.is_clean(h.ws.path()));
    assert_eq!(
        git.current_branch(h.ws.path()).as_deref(),
        Some(h.controller.main_branch())
    );
    assert_eq!(
        std::fs::read_to_string(h.ws.path().join("calc.ts")).unwrap(),
        "function f() { return 1 + 2; }\n"
    );

    let types: Vec<String> = sub.drain().into_iter().map(|e| e.event_type).collect();
    assert!(types.contains(&event_types::MERGE_CONFLICT.to_string()));
}

/// An untracked file on main that the branch wants to own: backed up,
/// removed, merge retried, branch version wins.
#[tokio::test]
async fn untracked_overwrite_is_backed_up_and_retried() {
    let h = Harness::new();

    h.controller.create_workspace("worker-a").await.unwrap();
    h.controller
        .apply_changes(
            "worker-a",
            &[FileChange {
                file_path: "config.local".into(),
                kind: ChangeKind::Create,
                content: Some("from-branch\n".into()),
            }],
            "add local config",
        )
        .unwrap();

    // Untracked file with the same path sits on main.
    std::fs::write(h.ws.path().join("config.local"), "untracked-on-main\n").unwrap();

    let merge = h.controller.merge_workspace("worker-a").await.unwrap();
    assert!(merge.merged);
    assert_eq!(
        std::fs::read_to_string(h.ws.path().join("config.local")).unwrap(),
        "from-branch\n"
    );
}

/// Worker timeout: the hung worker is cancelled after the budget, its
/// workspace disappears, and an independent worker is unaffected.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_timeout_fails_task_and_cleans_up() {
    let h = Harness::new();
    h.script_worker_hang("task-hang");
    h.script_worker_success("task-ok", &[("ok.txt", "fine\n")]);

    let config = SwarmConfig {
        worker_timeout_secs: 1,
        ..SwarmConfig::default()
    };
    let coordinator = h.coordinator(
        config,
        vec![Task::new("task-hang", "hangs"), Task::new("task-ok", "works")],
    );
    let stats = coordinator.run().await.unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);

    let plan = coordinator.plan_snapshot();
    let hung = plan.task("task-hang").unwrap();
    assert_eq!(hung.status, TaskStatus::Failed);
    let error = hung.result.as_ref().unwrap()["error"].as_str().unwrap();
    assert!(error.contains("timeout"), "error was: {error}");

    assert!(h.ws.path().join("ok.txt").exists());
    assert!(h.worktree_dirs().is_empty());
    assert!(h.swarm_branches().is_empty());
}

/// Restart mid-run: the running task resets to pending, its stale
/// workspace is destroyed before rescheduling, and the finished run leaves
/// no orphan branches.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_recovery_resets_running_tasks_and_stale_workspaces() {
    let h = Harness::new();

    let mut task_a = Task::new("task-a", "done earlier");
    task_a.advance(TaskStatus::Running).unwrap();
    task_a.advance(TaskStatus::Completed).unwrap();
    let mut task_b = Task::new("task-b", "was mid-flight");
    task_b.advance(TaskStatus::Running).unwrap();
    let task_c = Task::new("task-c", "never started");

    // Worker B's worktree survived the crash.
    h.controller.create_workspace("stale-worker-b").await.unwrap();
    assert!(!h.worktree_dirs().is_empty());

    let coordinator = h.coordinator(SwarmConfig::default(), vec![task_a, task_b, task_c]);
    coordinator.recover().unwrap();

    {
        let plan = coordinator.plan_snapshot();
        assert_eq!(plan.task("task-a").unwrap().status, TaskStatus::Completed);
        assert_eq!(plan.task("task-b").unwrap().status, TaskStatus::Pending);
        assert_eq!(plan.task("task-b").unwrap().attempts, 1);
        assert_eq!(plan.task("task-c").unwrap().status, TaskStatus::Pending);
    }
    assert!(h.worktree_dirs().is_empty(), "stale workspace must be destroyed");

    h.script_worker_success("task-b", &[("b.txt", "b\n")]);
    h.script_worker_success("task-c", &[("c.txt", "c\n")]);
    let stats = coordinator.run().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert!(h.swarm_branches().is_empty(), "no orphan branches after the run");
}

/// Stop cancels in-flight workers and completes with success=false.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_cancels_in_flight_workers() {
    let h = Harness::new();
    let sub = h.subscribe();
    h.script_worker_hang("task-hang");

    let coordinator = h.coordinator(
        SwarmConfig::default(),
        vec![Task::new("task-hang", "hangs")],
    );
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    // Give the worker time to start, then stop the run.
    tokio::time::sleep(Duration::from_millis(300)).await;
    coordinator.stop();
    let stats = runner.await.unwrap().unwrap();

    assert_eq!(stats.completed, 0);
    let completed_event = sub
        .drain()
        .into_iter()
        .find(|e| e.event_type == event_types::EXECUTION_COMPLETED)
        .expect("execution:completed missing");
    assert_eq!(completed_event.payload["success"], false);
}
