//! Content and filename search tools, gitignore-aware.

use globset::{Glob, GlobSetBuilder};

use crate::boundary::FileOperation;
use crate::tools::types::{Tool, ToolCallOutput, ToolContext, ToolDescriptor, ToolError};

/// Literal substring search across the worktree.
pub struct SearchGrepTool;

impl Tool for SearchGrepTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "search.grep".into(),
            description: "Search file contents for a literal string. Returns matching lines \
                          with file paths and line numbers; honors gitignore."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Literal text to find"},
                    "path": {"type": "string", "description": "Directory to search (default '.')"},
                    "case_insensitive": {"type": "boolean", "description": "Default false"},
                    "max_results": {"type": "integer", "description": "Max matching lines (default 100)"}
                },
                "required": ["pattern"]
            }),
            output_schema: None,
        }
    }

    fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: serde_json::Value,
    ) -> Result<ToolCallOutput, ToolError> {
        let pattern = input
            .get("pattern")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("pattern required".into()))?;
        let path = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let case_insensitive = input
            .get("case_insensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let max_results = input
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;

        ctx.gate(FileOperation::Read, path)?;
        let root = ctx.resolve(path);
        let needle = if case_insensitive {
            pattern.to_lowercase()
        } else {
            pattern.to_string()
        };

        let mut matches = Vec::new();
        let mut truncated = false;
        'walk: for entry in ignore::WalkBuilder::new(&root).hidden(false).build().flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let file_path = entry.path();
            let rel = file_path
                .strip_prefix(ctx.worktree)
                .unwrap_or(file_path)
                .to_string_lossy()
                .replace('\\', "/");
            if rel.split('/').any(|c| c == ".git") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(file_path) else {
                continue; // binary or unreadable
            };
            for (idx, line) in content.lines().enumerate() {
                let haystack = if case_insensitive {
                    line.to_lowercase()
                } else {
                    line.to_string()
                };
                if haystack.contains(&needle) {
                    matches.push(serde_json::json!({
                        "file": rel,
                        "line": idx + 1,
                        "text": line.trim_end(),
                    }));
                    if matches.len() >= max_results {
                        truncated = true;
                        break 'walk;
                    }
                }
            }
        }

        Ok(ToolCallOutput::ok(serde_json::json!({
            "pattern": pattern,
            "count": matches.len(),
            "truncated": truncated,
            "matches": matches,
        })))
    }
}

/// Find files by glob pattern.
pub struct SearchGlobTool;

impl Tool for SearchGlobTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "search.glob".into(),
            description: "Find files matching a glob pattern, e.g. 'src/**/*.ts'.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "max_results": {"type": "integer", "description": "Default 200"}
                },
                "required": ["pattern"]
            }),
            output_schema: None,
        }
    }

    fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: serde_json::Value,
    ) -> Result<ToolCallOutput, ToolError> {
        let pattern = input
            .get("pattern")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("pattern required".into()))?;
        let max_results = input
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(200) as usize;

        ctx.gate(FileOperation::Read, ".")?;

        let glob = Glob::new(pattern)
            .map_err(|e| ToolError::InvalidInput(format!("bad glob pattern: {e}")))?;
        let mut builder = GlobSetBuilder::new();
        builder.add(glob);
        let set = builder
            .build()
            .map_err(|e| ToolError::InvalidInput(format!("bad glob pattern: {e}")))?;

        let mut files = Vec::new();
        for entry in ignore::WalkBuilder::new(ctx.worktree)
            .hidden(false)
            .build()
            .flatten()
        {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(ctx.worktree)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if rel.split('/').any(|c| c == ".git") {
                continue;
            }
            if set.is_match(&rel) {
                files.push(rel);
                if files.len() >= max_results {
                    break;
                }
            }
        }
        files.sort();

        Ok(ToolCallOutput::ok(serde_json::json!({
            "pattern": pattern,
            "count": files.len(),
            "files": files,
        })))
    }
}
