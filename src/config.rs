//! Runtime configuration for a swarm run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// All recognized execution options. Every field has a default so partial
/// configs deserialize cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SwarmConfig {
    /// Upper bound on concurrently running workers.
    pub max_workers: usize,
    /// Wall-clock budget for a single worker, in seconds.
    pub worker_timeout_secs: u64,
    /// Model used when a task carries no complexity-specific override.
    pub default_model: String,
    /// Model used for `complex` tasks, if set.
    pub complex_task_model: Option<String>,
    /// Model used for `simple` tasks, if set.
    pub simple_task_model: Option<String>,
    /// Whether workers are asked to run tests after editing.
    pub auto_test: bool,
    /// Budget for worker-run test commands, in seconds.
    pub test_timeout_secs: u64,
    /// How many times a task may be retried before it is left failed.
    pub max_retries: u32,
    /// When true (default), a failed task skips its dependents but the rest
    /// of the plan keeps going. When false, the current wave finishes and
    /// the plan halts.
    pub skip_on_failure: bool,
    /// Always true for this substrate; carried for config compatibility.
    pub use_git_branches: bool,
    /// Always true for this substrate; carried for config compatibility.
    pub auto_merge: bool,
    /// Advisory cost ceiling in dollars. Surfaced in stats, not enforced.
    pub max_cost: Option<f64>,
    /// When this many merges are queued behind the git mutex, no new
    /// workers are started until the queue drains.
    pub merge_queue_backpressure_threshold: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            worker_timeout_secs: 30 * 60,
            default_model: "default".to_string(),
            complex_task_model: None,
            simple_task_model: None,
            auto_test: false,
            test_timeout_secs: 5 * 60,
            max_retries: 2,
            skip_on_failure: true,
            use_git_branches: true,
            auto_merge: true,
            max_cost: None,
            merge_queue_backpressure_threshold: 8,
        }
    }
}

impl SwarmConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    /// Model id for a task of the given complexity.
    pub fn model_for(&self, complexity: crate::plan::Complexity) -> &str {
        use crate::plan::Complexity;
        match complexity {
            Complexity::Complex => self
                .complex_task_model
                .as_deref()
                .unwrap_or(&self.default_model),
            Complexity::Simple => self
                .simple_task_model
                .as_deref()
                .unwrap_or(&self.default_model),
            Complexity::Medium => &self.default_model,
        }
    }
}
