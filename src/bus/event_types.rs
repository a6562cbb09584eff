//! Event type constants and the drop policy.
//!
//! Single source of truth for which events are "critical" (never dropped
//! under subscriber backpressure) vs droppable.

use super::event_bus::SwarmEvent;

// ---------------------------------------------------------------------------
// Plan lifecycle
// ---------------------------------------------------------------------------

pub const PLAN_STARTED: &str = "plan:started";
pub const PLAN_COMPLETED: &str = "plan:completed";
pub const TASK_UPDATE: &str = "task:update";
pub const STATS_UPDATE: &str = "stats:update";

// ---------------------------------------------------------------------------
// Worker lifecycle
// ---------------------------------------------------------------------------

pub const WORKER_CREATED: &str = "worker:created";
pub const WORKER_STATUS_UPDATED: &str = "worker:status-updated";
pub const WORKER_ANALYZING: &str = "worker:analyzing";
pub const WORKER_ANALYZED: &str = "worker:analyzed";
pub const WORKER_STRATEGY_DECIDED: &str = "worker:strategy_decided";
pub const WORKER_TASK_COMPLETED: &str = "worker:task-completed";
pub const WORKER_TASK_FAILED: &str = "worker:task-failed";

// ---------------------------------------------------------------------------
// Git surface
// ---------------------------------------------------------------------------

pub const BRANCH_CREATED: &str = "branch:created";
pub const BRANCH_DELETED: &str = "branch:deleted";
pub const BRANCH_ROLLBACK: &str = "branch:rollback";
pub const BRANCH_SYNCED: &str = "branch:synced";
pub const COMMIT_CREATED: &str = "commit:created";
pub const MERGE_SUCCESS: &str = "merge:success";
pub const MERGE_CONFLICT: &str = "merge:conflict";

// ---------------------------------------------------------------------------
// Execution control
// ---------------------------------------------------------------------------

pub const EXECUTION_PAUSED: &str = "execution:paused";
pub const EXECUTION_RESUMED: &str = "execution:resumed";
pub const EXECUTION_COMPLETED: &str = "execution:completed";
pub const EXECUTION_ERROR: &str = "execution:error";

/// Critical events survive subscriber-buffer overflow; anything else may be
/// dropped oldest-first when a subscriber falls behind. Task terminal
/// states and merge results must reach every subscriber.
pub fn is_critical(event: &SwarmEvent) -> bool {
    match event.event_type.as_str() {
        MERGE_SUCCESS | MERGE_CONFLICT | PLAN_COMPLETED | EXECUTION_COMPLETED
        | EXECUTION_ERROR | WORKER_TASK_COMPLETED | WORKER_TASK_FAILED => true,
        TASK_UPDATE => event
            .payload
            .get("status")
            .and_then(|s| s.as_str())
            .map(|s| matches!(s, "completed" | "failed" | "skipped"))
            .unwrap_or(false),
        _ => false,
    }
}
