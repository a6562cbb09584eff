//! Deterministic conversation loop that replays a prepared script.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ConversationLoop, LoopError, LoopEvent, LoopFactory, LoopPurpose};

/// One scripted action within a turn.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Emit a text delta.
    Text(String),
    /// Request a tool call; the harness executes it and the loop echoes a
    /// `ToolEnd` with whatever came back.
    Tool {
        name: String,
        input: serde_json::Value,
    },
    /// Park forever. Used to simulate a hung backend for timeout tests.
    Hang,
    /// Fail the turn with a backend error.
    Fail(String),
}

/// A full turn: its steps run in order, then the turn ends with `Done`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub steps: Vec<ScriptedStep>,
}

impl ScriptedTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            steps: vec![ScriptedStep::Text(content.into())],
        }
    }

    pub fn steps(steps: Vec<ScriptedStep>) -> Self {
        Self { steps }
    }
}

enum Pending {
    /// Next `next_event` yields this.
    Event(LoopEvent),
    /// Waiting on `submit_tool_result` for the named tool.
    ToolResult(String),
}

/// Replays scripted turns. Each `start_turn` consumes the next
/// [`ScriptedTurn`]; running past the script ends turns immediately.
pub struct ScriptedLoop {
    turns: VecDeque<ScriptedTurn>,
    current: VecDeque<ScriptedStep>,
    in_turn: bool,
    pending: Option<Pending>,
    interrupted: bool,
    /// Prompts received, for assertions.
    pub prompts: Vec<String>,
}

impl ScriptedLoop {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: turns.into(),
            current: VecDeque::new(),
            in_turn: false,
            pending: None,
            interrupted: false,
            prompts: Vec::new(),
        }
    }
}

#[async_trait]
impl ConversationLoop for ScriptedLoop {
    async fn start_turn(&mut self, prompt: String) -> Result<(), LoopError> {
        self.prompts.push(prompt);
        self.current = self.turns.pop_front().unwrap_or_default().steps.into();
        self.in_turn = true;
        self.pending = None;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<LoopEvent, LoopError> {
        if self.interrupted {
            self.in_turn = false;
            return Ok(LoopEvent::Interrupted);
        }
        if !self.in_turn {
            return Err(LoopError::NoActiveTurn);
        }
        match self.pending.take() {
            Some(Pending::Event(event)) => return Ok(event),
            Some(pending @ Pending::ToolResult(_)) => {
                self.pending = Some(pending);
                return Err(LoopError::PendingToolResult);
            }
            None => {}
        }

        match self.current.pop_front() {
            Some(ScriptedStep::Text(content)) => Ok(LoopEvent::Text { content }),
            Some(ScriptedStep::Tool { name, input }) => {
                self.pending = Some(Pending::ToolResult(name.clone()));
                Ok(LoopEvent::ToolStart {
                    tool_name: name,
                    tool_input: input,
                })
            }
            Some(ScriptedStep::Hang) => {
                std::future::pending::<()>().await;
                unreachable!("pending future never resolves")
            }
            Some(ScriptedStep::Fail(message)) => {
                self.in_turn = false;
                Err(LoopError::Backend(message))
            }
            None => {
                self.in_turn = false;
                Ok(LoopEvent::Done)
            }
        }
    }

    async fn submit_tool_result(
        &mut self,
        tool_name: &str,
        result: Result<serde_json::Value, String>,
    ) -> Result<(), LoopError> {
        match self.pending.take() {
            Some(Pending::ToolResult(expected)) if expected == tool_name => {
                let (tool_result, tool_error) = match result {
                    Ok(value) => (value, None),
                    Err(error) => (serde_json::Value::Null, Some(error)),
                };
                self.pending = Some(Pending::Event(LoopEvent::ToolEnd {
                    tool_name: tool_name.to_string(),
                    tool_result,
                    tool_error,
                }));
                Ok(())
            }
            other => {
                self.pending = other;
                Err(LoopError::NoActiveTurn)
            }
        }
    }

    async fn interrupt(&mut self) {
        self.interrupted = true;
    }
}

/// Hands out pre-registered scripted loops keyed by `(task id, purpose)`.
/// Unregistered lookups get an empty loop that completes immediately.
#[derive(Default)]
pub struct ScriptedLoopFactory {
    scripts: Mutex<HashMap<(String, &'static str), VecDeque<Vec<ScriptedTurn>>>>,
}

fn purpose_key(purpose: LoopPurpose) -> &'static str {
    match purpose {
        LoopPurpose::Analysis => "analysis",
        LoopPurpose::Execution => "execution",
        LoopPurpose::Supervision => "supervision",
    }
}

impl ScriptedLoopFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the turns handed out on the next `open` for this task and
    /// purpose. Multiple registrations queue.
    pub fn register(&self, task_id: &str, purpose: LoopPurpose, turns: Vec<ScriptedTurn>) {
        self.scripts
            .lock()
            .expect("script registry poisoned")
            .entry((task_id.to_string(), purpose_key(purpose)))
            .or_default()
            .push_back(turns);
    }
}

impl LoopFactory for ScriptedLoopFactory {
    fn open(&self, task_id: &str, purpose: LoopPurpose) -> Box<dyn ConversationLoop> {
        let turns = self
            .scripts
            .lock()
            .expect("script registry poisoned")
            .get_mut(&(task_id.to_string(), purpose_key(purpose)))
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default();
        Box::new(ScriptedLoop::new(turns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn turn_yields_steps_then_done() {
        let mut looped = ScriptedLoop::new(vec![ScriptedTurn::steps(vec![
            ScriptedStep::Text("thinking".into()),
            ScriptedStep::Tool {
                name: "fs.read".into(),
                input: serde_json::json!({"path": "a.txt"}),
            },
        ])]);

        looped.start_turn("go".into()).await.unwrap();
        assert!(matches!(
            looped.next_event().await.unwrap(),
            LoopEvent::Text { .. }
        ));
        let LoopEvent::ToolStart { tool_name, .. } = looped.next_event().await.unwrap() else {
            panic!("expected tool start");
        };
        assert_eq!(tool_name, "fs.read");

        // Demanding another event before the result is a protocol error.
        assert!(matches!(
            looped.next_event().await,
            Err(LoopError::PendingToolResult)
        ));

        looped
            .submit_tool_result("fs.read", Ok(serde_json::json!({"content": "hi"})))
            .await
            .unwrap();
        assert!(matches!(
            looped.next_event().await.unwrap(),
            LoopEvent::ToolEnd { tool_error: None, .. }
        ));
        assert!(matches!(looped.next_event().await.unwrap(), LoopEvent::Done));
    }

    #[tokio::test]
    async fn interrupt_preempts_remaining_steps() {
        let mut looped = ScriptedLoop::new(vec![ScriptedTurn::text("never seen")]);
        looped.start_turn("go".into()).await.unwrap();
        looped.interrupt().await;
        assert!(matches!(
            looped.next_event().await.unwrap(),
            LoopEvent::Interrupted
        ));
    }

    #[tokio::test]
    async fn factory_hands_out_scripts_by_task_and_purpose() {
        let factory = ScriptedLoopFactory::new();
        factory.register("t1", LoopPurpose::Analysis, vec![ScriptedTurn::text("a")]);

        let mut registered = factory.open("t1", LoopPurpose::Analysis);
        registered.start_turn("p".into()).await.unwrap();
        assert!(matches!(
            registered.next_event().await.unwrap(),
            LoopEvent::Text { .. }
        ));

        // Unregistered combination completes immediately.
        let mut empty = factory.open("t1", LoopPurpose::Execution);
        empty.start_turn("p".into()).await.unwrap();
        assert!(matches!(empty.next_event().await.unwrap(), LoopEvent::Done));
    }
}
