//! Tool registry and implementations.
//!
//! Tools are what agent loops act through. Every invocation runs under a
//! [`ToolContext`] carrying the caller's boundary identity; write-class
//! tools additionally require a change buffer and stage edits instead of
//! touching disk (the worker flushes the buffer at commit time).

mod cmd;
mod fs;
mod search;
pub mod types;

use std::collections::HashMap;

pub use types::{
    ChangeBuffer, Tool, ToolCallInput, ToolCallOutput, ToolContext, ToolDescriptor, ToolError,
};

use cmd::CommandExecTool;
use fs::{FsDeleteTool, FsEditTool, FsListTool, FsReadTool, FsWriteTool};
use search::{SearchGlobTool, SearchGrepTool};

/// Tools available during read-only analysis.
const READ_ONLY_TOOLS: &[&str] = &["fs.read", "fs.list", "search.grep", "search.glob"];

/// Registry of all built-in tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    /// All built-in tools registered.
    pub fn standard() -> Self {
        let mut tools: HashMap<String, Box<dyn Tool>> = HashMap::new();

        // Filesystem
        tools.insert("fs.read".to_string(), Box::new(FsReadTool));
        tools.insert("fs.write".to_string(), Box::new(FsWriteTool));
        tools.insert("fs.edit".to_string(), Box::new(FsEditTool));
        tools.insert("fs.delete".to_string(), Box::new(FsDeleteTool));
        tools.insert("fs.list".to_string(), Box::new(FsListTool));

        // Search
        tools.insert("search.grep".to_string(), Box::new(SearchGrepTool));
        tools.insert("search.glob".to_string(), Box::new(SearchGlobTool));

        // Command execution
        tools.insert("cmd.exec".to_string(), Box::new(CommandExecTool));

        Self { tools }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut list: Vec<ToolDescriptor> = self.tools.values().map(|t| t.descriptor()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Descriptors for the worker's analysis phase (no mutation, no shell).
    pub fn read_only_descriptors(&self) -> Vec<ToolDescriptor> {
        self.descriptors()
            .into_iter()
            .filter(|d| READ_ONLY_TOOLS.contains(&d.name.as_str()))
            .collect()
    }

    pub fn is_read_only(name: &str) -> bool {
        READ_ONLY_TOOLS.contains(&name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Invoke a tool by name.
    pub fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: ToolCallInput,
    ) -> Result<ToolCallOutput, ToolError> {
        let tool = self
            .tools
            .get(&input.name)
            .ok_or_else(|| ToolError::UnknownTool(input.name.clone()))?;
        tool.invoke(ctx, input.args)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Blueprint;
    use crate::boundary::{ActorRole, BoundaryChecker};
    use crate::testing::temp_workspace;

    fn ctx<'a>(
        boundary: &'a BoundaryChecker,
        worktree: &'a std::path::Path,
        buffer: Option<&'a ChangeBuffer>,
    ) -> ToolContext<'a> {
        ToolContext {
            boundary,
            role: ActorRole::Worker,
            module_id: None,
            worktree,
            buffer,
        }
    }

    #[test]
    fn registry_has_all_builtin_tools() {
        let registry = ToolRegistry::standard();
        let names: Vec<String> = registry.descriptors().iter().map(|d| d.name.clone()).collect();
        for expected in [
            "cmd.exec",
            "fs.delete",
            "fs.edit",
            "fs.list",
            "fs.read",
            "fs.write",
            "search.glob",
            "search.grep",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn read_only_view_excludes_writes_and_shell() {
        let registry = ToolRegistry::standard();
        let names: Vec<String> = registry
            .read_only_descriptors()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert!(names.contains(&"fs.read".to_string()));
        assert!(!names.contains(&"fs.write".to_string()));
        assert!(!names.contains(&"cmd.exec".to_string()));
    }

    #[test]
    fn write_stages_into_buffer_not_disk() {
        let ws = temp_workspace();
        let bp = Blueprint::new("t", ws.path());
        let boundary = BoundaryChecker::new(&bp);
        let buffer = ChangeBuffer::new();
        let registry = ToolRegistry::standard();

        let output = registry
            .invoke(
                &ctx(&boundary, ws.path(), Some(&buffer)),
                ToolCallInput {
                    name: "fs.write".into(),
                    args: serde_json::json!({"path": "src/new.ts", "content": "export {};\n"}),
                },
            )
            .unwrap();
        assert!(output.ok);
        assert_eq!(buffer.len(), 1);
        assert!(!ws.path().join("src/new.ts").exists());
    }

    #[test]
    fn read_sees_buffered_write() {
        let ws = temp_workspace();
        let bp = Blueprint::new("t", ws.path());
        let boundary = BoundaryChecker::new(&bp);
        let buffer = ChangeBuffer::new();
        let registry = ToolRegistry::standard();
        let context = ctx(&boundary, ws.path(), Some(&buffer));

        registry
            .invoke(
                &context,
                ToolCallInput {
                    name: "fs.write".into(),
                    args: serde_json::json!({"path": "a.txt", "content": "buffered line\n"}),
                },
            )
            .unwrap();
        let read = registry
            .invoke(
                &context,
                ToolCallInput {
                    name: "fs.read".into(),
                    args: serde_json::json!({"path": "a.txt", "line_numbers": false}),
                },
            )
            .unwrap();
        assert!(read
            .data
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("buffered line"));
    }

    #[test]
    fn edit_applies_to_buffered_content() {
        let ws = temp_workspace();
        let bp = Blueprint::new("t", ws.path());
        let boundary = BoundaryChecker::new(&bp);
        let buffer = ChangeBuffer::new();
        let registry = ToolRegistry::standard();
        let context = ctx(&boundary, ws.path(), Some(&buffer));

        registry
            .invoke(
                &context,
                ToolCallInput {
                    name: "fs.write".into(),
                    args: serde_json::json!({"path": "a.txt", "content": "hello old world\n"}),
                },
            )
            .unwrap();
        registry
            .invoke(
                &context,
                ToolCallInput {
                    name: "fs.edit".into(),
                    args: serde_json::json!({"path": "a.txt", "old_string": "old", "new_string": "new"}),
                },
            )
            .unwrap();

        let changes = buffer.drain();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].content.as_deref(), Some("hello new world\n"));
    }

    #[test]
    fn denied_write_is_an_access_error() {
        let ws = temp_workspace();
        let bp = Blueprint::new("t", ws.path());
        let boundary = BoundaryChecker::new(&bp);
        let buffer = ChangeBuffer::new();
        let registry = ToolRegistry::standard();

        let result = registry.invoke(
            &ctx(&boundary, ws.path(), Some(&buffer)),
            ToolCallInput {
                name: "fs.write".into(),
                args: serde_json::json!({"path": "blueprint.json", "content": "{}"}),
            },
        );
        assert!(matches!(result, Err(ToolError::AccessDenied(_))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn write_without_buffer_fails() {
        let ws = temp_workspace();
        let bp = Blueprint::new("t", ws.path());
        let boundary = BoundaryChecker::new(&bp);
        let registry = ToolRegistry::standard();

        let result = registry.invoke(
            &ctx(&boundary, ws.path(), None),
            ToolCallInput {
                name: "fs.write".into(),
                args: serde_json::json!({"path": "a.txt", "content": "x"}),
            },
        );
        assert!(matches!(result, Err(ToolError::Execution(_))));
    }

    #[test]
    fn unknown_tool_is_reported_by_name() {
        let ws = temp_workspace();
        let bp = Blueprint::new("t", ws.path());
        let boundary = BoundaryChecker::new(&bp);
        let registry = ToolRegistry::standard();
        let result = registry.invoke(
            &ctx(&boundary, ws.path(), None),
            ToolCallInput {
                name: "nonexistent.tool".into(),
                args: serde_json::json!({}),
            },
        );
        match result {
            Err(ToolError::UnknownTool(name)) => assert_eq!(name, "nonexistent.tool"),
            other => panic!("expected unknown tool error, got {other:?}"),
        }
    }
}
