//! Contract for the external AI conversation loop.
//!
//! The model backend is an external collaborator: it consumes a prompt and
//! produces a stream of text and tool events. This crate never talks to a
//! provider directly; workers and the supervisor drive any
//! [`ConversationLoop`] implementation the embedder hands them.
//!
//! The crate ships one implementation, [`ScriptedLoop`], which replays a
//! predetermined event script. It backs the test suite and dry runs.

mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use scripted::{ScriptedLoop, ScriptedLoopFactory, ScriptedStep, ScriptedTurn};

/// One event from the model stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    Text {
        content: String,
    },
    ToolStart {
        tool_name: String,
        tool_input: serde_json::Value,
    },
    ToolEnd {
        tool_name: String,
        tool_result: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_error: Option<String>,
    },
    /// The current turn is finished.
    Done,
    /// The loop was cancelled mid-turn.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("conversation backend failed: {0}")]
    Backend(String),
    #[error("no active turn")]
    NoActiveTurn,
    #[error("a tool result was expected before the next event")]
    PendingToolResult,
}

/// Driving seam between the runtime and a model backend.
///
/// Protocol per turn: `start_turn`, then `next_event` until `Done` or
/// `Interrupted`. After a `ToolStart` the caller executes the tool and
/// feeds the outcome back through `submit_tool_result`; the loop then
/// echoes a `ToolEnd` carrying it. The loop object itself persists across
/// turns, which is what keeps the supervisor's conversation long-lived.
#[async_trait]
pub trait ConversationLoop: Send {
    async fn start_turn(&mut self, prompt: String) -> Result<(), LoopError>;

    async fn next_event(&mut self) -> Result<LoopEvent, LoopError>;

    async fn submit_tool_result(
        &mut self,
        tool_name: &str,
        result: Result<serde_json::Value, String>,
    ) -> Result<(), LoopError>;

    /// Cooperative cancellation; the next `next_event` yields
    /// [`LoopEvent::Interrupted`].
    async fn interrupt(&mut self);
}

/// Which phase of work a loop is opened for. Factories may hand out
/// differently primed conversations per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPurpose {
    /// Read-only exploration plus the strategy turn.
    Analysis,
    /// Write-capable task execution.
    Execution,
    /// The supervisor's persistent planning conversation.
    Supervision,
}

/// Opens fresh conversation loops on demand. Workers open one analysis and
/// one execution loop per task; the supervisor opens a single supervision
/// loop for the whole run.
pub trait LoopFactory: Send + Sync {
    fn open(&self, task_id: &str, purpose: LoopPurpose) -> Box<dyn ConversationLoop>;
}
