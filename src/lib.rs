//! Swarm execution substrate.
//!
//! This crate implements the concurrent core of a multi-agent software
//! development swarm: from a confirmed blueprint and a dependency-ordered
//! task plan, it dispatches worker agents into isolated git worktrees,
//! merges finished branches back to the mainline under a serial discipline,
//! and funnels realtime state to subscribers over a typed event bus.
//!
//! # Architecture
//!
//! The components, leaves first:
//! - `lock`: fair FIFO async mutex guarding the mainline git surface
//! - `bus`: typed pub-sub of execution events
//! - `boundary`: pure predicate deciding an actor's file-access rights
//! - `worktree`: per-worker worktree lifecycle, merge, conflict resolution
//! - `conversation`: contract for the external AI conversation loop
//! - `tools`: boundary-gated tools exposed to agent loops
//! - `worker`: one agent executing one task inside its worktree
//! - `coordinator`: topological wave scheduler over the task DAG
//! - `supervisor`: long-lived lead conversation that plans and dispatches
//!
//! The UI layer, blueprint elicitation, session persistence, and the AI
//! backend itself are external collaborators; only their contracts appear
//! here.

pub mod blueprint;
pub mod boundary;
pub mod bus;
pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod lock;
pub mod plan;
pub mod supervisor;
pub mod telemetry;
pub mod tools;
pub mod worker;
pub mod worktree;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

/// Top-level error type for embedders that drive a whole run and do not
/// care which component failed.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("{0}")]
    Worktree(#[from] worktree::WorktreeError),
    #[error("{0}")]
    Coordinator(#[from] coordinator::CoordinatorError),
    #[error("{0}")]
    Supervisor(#[from] supervisor::SupervisorError),
    #[error("{0}")]
    Plan(#[from] plan::PlanError),
}
