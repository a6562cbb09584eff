//! Shell command execution, allowlist-guarded.

use std::process::Command;

use crate::tools::types::{Tool, ToolCallOutput, ToolContext, ToolDescriptor, ToolError};

const OUTPUT_CAP: usize = 20_000;

/// Binaries agent loops are allowed to run. Everything else is denied and
/// the denial is fed back to the model as a tool error.
const ALLOWLIST: &[&str] = &[
    // Version control
    "git",
    // Search
    "rg",
    // JavaScript / Node toolchain
    "node", "npm", "npx", "yarn", "pnpm", "bun", "bunx", "deno",
    // Rust
    "cargo", "rustc",
    // Python
    "python", "python3", "pip", "pip3", "uv",
    // File operations
    "mkdir", "cp", "mv", "rm", "ls", "cat", "touch",
    // Common dev tools
    "echo", "tar", "make",
    // Testing / linting
    "jest", "vitest", "eslint", "prettier", "tsc",
];

pub struct CommandExecTool;

impl Tool for CommandExecTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "cmd.exec".into(),
            description: "Run an allowlisted command in the worktree and capture its output."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "cmd": {"type": "string", "description": "Binary to run"},
                    "args": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Arguments"
                    }
                },
                "required": ["cmd"]
            }),
            output_schema: None,
        }
    }

    fn invoke(
        &self,
        ctx: &ToolContext<'_>,
        input: serde_json::Value,
    ) -> Result<ToolCallOutput, ToolError> {
        let cmd = input
            .get("cmd")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("cmd required".into()))?;
        let args: Vec<String> = input
            .get("args")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // Strip any path prefix and Windows suffix before matching.
        let binary = cmd.rsplit(['/', '\\']).next().unwrap_or(cmd);
        let binary = binary.strip_suffix(".exe").unwrap_or(binary);
        if !ALLOWLIST.contains(&binary) {
            return Err(ToolError::AccessDenied(format!("command not allowed: {cmd}")));
        }

        let output = Command::new(cmd)
            .args(&args)
            .current_dir(ctx.worktree)
            .output()
            .map_err(|e| ToolError::Execution(format!("failed to run {cmd}: {e}")))?;

        let cap = |bytes: &[u8]| -> String {
            let mut text = String::from_utf8_lossy(bytes).to_string();
            if text.len() > OUTPUT_CAP {
                text.truncate(OUTPUT_CAP);
                text.push_str("\n[truncated]");
            }
            text
        };

        Ok(ToolCallOutput {
            ok: output.status.success(),
            data: serde_json::json!({
                "exit_code": output.status.code(),
                "stdout": cap(&output.stdout),
                "stderr": cap(&output.stderr),
            }),
            error: if output.status.success() {
                None
            } else {
                Some(format!("{cmd} exited with {:?}", output.status.code()))
            },
        })
    }
}
