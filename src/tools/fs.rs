//! Filesystem tools.
//!
//! Reads observe the worker's staged-but-unflushed edits through the change
//! buffer, so the model always sees the tree it is actually building.
//! Writes never touch disk directly; they stage [`FileChange`]s.

use crate::boundary::FileOperation;
use crate::tools::types::{Tool, ToolCallOutput, ToolContext, ToolDescriptor, ToolError};
use crate::worktree::{ChangeKind, FileChange};

fn path_arg(input: &serde_json::Value) -> Result<String, ToolError> {
    input
        .get("path")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidInput("path required".into()))
}

/// Read file contents, with optional offset/limit for large files.
pub struct FsReadTool;

impl Tool for FsReadTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "fs.read".into(),
            description: "Read file contents. Supports offset/limit for large files; \
                          returns content with line numbers by default."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the worktree root"},
                    "offset": {"type": "integer", "description": "Start line, 1-indexed (default 1)"},
                    "limit": {"type": "integer", "description": "Max lines to read (default 2000)"},
                    "line_numbers": {"type": "boolean", "description": "Prefix lines with numbers (default true)"}
                },
                "required": ["path"]
            }),
            output_schema: None,
        }
    }

    fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: serde_json::Value,
    ) -> Result<ToolCallOutput, ToolError> {
        let path = path_arg(&input)?;
        let offset = input.get("offset").and_then(|v| v.as_u64()).unwrap_or(1).max(1);
        let limit = input.get("limit").and_then(|v| v.as_u64()).unwrap_or(2000);
        let line_numbers = input
            .get("line_numbers")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        ctx.gate(FileOperation::Read, &path)?;

        let full = ctx.resolve(&path);
        let content = match ctx.buffer {
            Some(buffer) => buffer
                .effective_content(&path, &full)
                .map_err(|e| ToolError::Execution(e.to_string()))?,
            None => {
                if full.is_file() {
                    Some(
                        std::fs::read_to_string(&full)
                            .map_err(|e| ToolError::Execution(e.to_string()))?,
                    )
                } else {
                    None
                }
            }
        };
        let Some(content) = content else {
            return Err(ToolError::Execution(format!("file not found: {path}")));
        };

        let rendered: Vec<String> = content
            .lines()
            .enumerate()
            .skip(offset as usize - 1)
            .take(limit as usize)
            .map(|(idx, line)| {
                if line_numbers {
                    format!("{}: {}", idx + 1, line)
                } else {
                    line.to_string()
                }
            })
            .collect();

        Ok(ToolCallOutput::ok(serde_json::json!({
            "path": path,
            "content": rendered.join("\n"),
            "offset": offset,
            "limit": limit,
        })))
    }
}

/// Stage a full-file write.
pub struct FsWriteTool;

impl Tool for FsWriteTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "fs.write".into(),
            description: "Write file contents. Creates parent directories as needed; \
                          the write lands on the worker branch at commit time."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
            output_schema: None,
        }
    }

    fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: serde_json::Value,
    ) -> Result<ToolCallOutput, ToolError> {
        let path = path_arg(&input)?;
        let content = input
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("content required".into()))?;

        let decision = ctx.gate(FileOperation::Write, &path)?;
        let buffer = ctx.buffer()?;

        let exists = buffer
            .effective_content(&path, &ctx.resolve(&path))
            .map_err(|e| ToolError::Execution(e.to_string()))?
            .is_some();
        buffer.push(FileChange {
            file_path: path.clone(),
            kind: if exists { ChangeKind::Modify } else { ChangeKind::Create },
            content: Some(content.to_string()),
        });

        Ok(ToolCallOutput::ok(serde_json::json!({
            "path": path,
            "bytes": content.len(),
            "warnings": decision.warnings,
        })))
    }
}

/// Stage a targeted string replacement.
pub struct FsEditTool;

impl Tool for FsEditTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "fs.edit".into(),
            description: "Replace the first occurrence of old_string with new_string in a file."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"}
                },
                "required": ["path", "old_string", "new_string"]
            }),
            output_schema: None,
        }
    }

    fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: serde_json::Value,
    ) -> Result<ToolCallOutput, ToolError> {
        let path = path_arg(&input)?;
        let old = input
            .get("old_string")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("old_string required".into()))?;
        let new = input
            .get("new_string")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("new_string required".into()))?;

        let decision = ctx.gate(FileOperation::Write, &path)?;
        let buffer = ctx.buffer()?;

        let current = buffer
            .effective_content(&path, &ctx.resolve(&path))
            .map_err(|e| ToolError::Execution(e.to_string()))?
            .ok_or_else(|| ToolError::Execution(format!("file not found: {path}")))?;
        if !current.contains(old) {
            return Err(ToolError::Execution(format!(
                "old_string not found in {path}"
            )));
        }
        let updated = current.replacen(old, new, 1);
        buffer.push(FileChange {
            file_path: path.clone(),
            kind: ChangeKind::Modify,
            content: Some(updated),
        });

        Ok(ToolCallOutput::ok(serde_json::json!({
            "path": path,
            "warnings": decision.warnings,
        })))
    }
}

/// Stage a file deletion.
pub struct FsDeleteTool;

impl Tool for FsDeleteTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "fs.delete".into(),
            description: "Delete a file from the worker branch.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"}
                },
                "required": ["path"]
            }),
            output_schema: None,
        }
    }

    fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: serde_json::Value,
    ) -> Result<ToolCallOutput, ToolError> {
        let path = path_arg(&input)?;
        let decision = ctx.gate(FileOperation::Delete, &path)?;
        let buffer = ctx.buffer()?;
        buffer.push(FileChange {
            file_path: path.clone(),
            kind: ChangeKind::Delete,
            content: None,
        });
        Ok(ToolCallOutput::ok(serde_json::json!({
            "path": path,
            "warnings": decision.warnings,
        })))
    }
}

/// List directory contents, honoring gitignore.
pub struct FsListTool;

impl Tool for FsListTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "fs.list".into(),
            description: "List files under a directory, honoring gitignore. \
                          Supports a recursion depth limit and entry cap."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory relative to worktree root (default '.')"},
                    "max_depth": {"type": "integer", "description": "Recursion depth (default 3)"},
                    "limit": {"type": "integer", "description": "Max entries (default 200)"}
                }
            }),
            output_schema: None,
        }
    }

    fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: serde_json::Value,
    ) -> Result<ToolCallOutput, ToolError> {
        let path = input
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();
        let max_depth = input.get("max_depth").and_then(|v| v.as_u64()).unwrap_or(3) as usize;
        let limit = input
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(200)
            .clamp(1, 2000) as usize;

        ctx.gate(FileOperation::Read, &path)?;
        let full = ctx.resolve(&path);
        if !full.is_dir() {
            return Err(ToolError::Execution(format!("not a directory: {path}")));
        }

        let mut entries = Vec::new();
        let mut truncated = false;
        for entry in ignore::WalkBuilder::new(&full)
            .max_depth(Some(max_depth))
            .hidden(false)
            .build()
            .flatten()
        {
            let entry_path = entry.path();
            if entry_path == full {
                continue;
            }
            let rel = entry_path
                .strip_prefix(ctx.worktree)
                .unwrap_or(entry_path)
                .to_string_lossy()
                .replace('\\', "/");
            if rel.split('/').any(|c| c == ".git") {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(serde_json::json!({
                "path": rel,
                "is_dir": is_dir,
            }));
            if entries.len() >= limit {
                truncated = true;
                break;
            }
        }
        entries.sort_by(|a, b| {
            let a = a.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            let b = b.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            a.cmp(b)
        });

        Ok(ToolCallOutput::ok(serde_json::json!({
            "path": path,
            "count": entries.len(),
            "truncated": truncated,
            "entries": entries,
        })))
    }
}
