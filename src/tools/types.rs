//! Shared types for the tool system.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::boundary::{AccessDecision, ActorRole, BoundaryChecker, FileOperation};
use crate::worktree::{ChangeKind, FileChange};

/// MCP-compatible tool descriptor: name, description, JSON input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// Input to a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallInput {
    pub name: String,
    pub args: serde_json::Value,
}

/// Output from a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallOutput {
    pub ok: bool,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

impl ToolCallOutput {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data,
            error: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// Everything a tool needs to run: the boundary checker identity it runs
/// under, the worktree it operates in, and (for write-capable phases) the
/// change buffer edits are staged into.
pub struct ToolContext<'a> {
    pub boundary: &'a BoundaryChecker,
    pub role: ActorRole,
    pub module_id: Option<&'a str>,
    pub worktree: &'a Path,
    pub buffer: Option<&'a ChangeBuffer>,
}

impl<'a> ToolContext<'a> {
    /// Boundary-check `path` for `operation`; denial becomes a tool error
    /// the model can react to.
    pub fn gate(&self, operation: FileOperation, path: &str) -> Result<AccessDecision, ToolError> {
        let decision = self.boundary.check(self.role, operation, path, self.module_id);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(ToolError::AccessDenied(
                decision.reason.unwrap_or_else(|| "access denied".to_string()),
            ))
        }
    }

    pub fn buffer(&self) -> Result<&'a ChangeBuffer, ToolError> {
        self.buffer.ok_or_else(|| {
            ToolError::Execution("write tools are not available in this phase".to_string())
        })
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.worktree.join(path)
        }
    }
}

/// One tool. Implementations are stateless; all per-call state rides in the
/// [`ToolContext`].
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    fn invoke(&self, ctx: &ToolContext<'_>, input: serde_json::Value)
        -> Result<ToolCallOutput, ToolError>;
}

// ---------------------------------------------------------------------------
// ChangeBuffer
// ---------------------------------------------------------------------------

/// In-memory staging area for a worker's edits. Write tools append here
/// instead of touching disk; the worker flushes the batch through the
/// worktree controller in one apply-and-commit step. Order of submission is
/// order of application.
#[derive(Default)]
pub struct ChangeBuffer {
    changes: Mutex<Vec<FileChange>>,
}

impl ChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, change: FileChange) {
        self.changes.lock().expect("change buffer poisoned").push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.lock().expect("change buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the batch, leaving the buffer empty.
    pub fn drain(&self) -> Vec<FileChange> {
        std::mem::take(&mut *self.changes.lock().expect("change buffer poisoned"))
    }

    /// Paths touched so far, deduplicated, in first-touch order.
    pub fn touched_paths(&self) -> Vec<String> {
        let changes = self.changes.lock().expect("change buffer poisoned");
        let mut seen = std::collections::HashSet::new();
        changes
            .iter()
            .filter(|c| seen.insert(c.file_path.clone()))
            .map(|c| c.file_path.clone())
            .collect()
    }

    /// The content `path` would have if the buffer were flushed now:
    /// the latest buffered write wins, a buffered delete reads as absent,
    /// otherwise fall through to disk.
    pub fn effective_content(
        &self,
        path: &str,
        on_disk: &Path,
    ) -> Result<Option<String>, std::io::Error> {
        let changes = self.changes.lock().expect("change buffer poisoned");
        for change in changes.iter().rev() {
            if change.file_path == path {
                return Ok(match change.kind {
                    ChangeKind::Delete => None,
                    _ => Some(change.content.clone().unwrap_or_default()),
                });
            }
        }
        drop(changes);
        if on_disk.is_file() {
            Ok(Some(std::fs::read_to_string(on_disk)?))
        } else {
            Ok(None)
        }
    }
}
