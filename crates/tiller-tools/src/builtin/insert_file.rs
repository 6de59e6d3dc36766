// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use tiller_vault::atomic_write;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::ArgSpec;

/// Insert text at a line position: 0 prepends, -1 appends, k > 0 inserts
/// after line k.
pub struct InsertFileTool;

#[async_trait]
impl Tool for InsertFileTool {
    fn name(&self) -> &str {
        "insert_file"
    }

    fn description(&self) -> &str {
        "Insert text into a file without replacing anything.\n\
         line=0 prepends, line=-1 appends, line=k inserts after line k."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("path", true, "File to modify")
            .integer("line", true, -1, i64::MAX, "Insert position (0 prepend, -1 append)")
            .string("text", true, "Text to insert")
    }

    fn mutated_paths(&self, args: &Value) -> Vec<String> {
        args.get("path")
            .and_then(Value::as_str)
            .map(|p| vec![p.to_string()])
            .unwrap_or_default()
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let path = call.args["path"].as_str().unwrap_or_default().to_string();
        let line = call.args["line"].as_i64().unwrap_or(-1);
        let text = call.args["text"].as_str().unwrap_or_default();

        let original = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolOutput::err(
                    &call.id,
                    ToolError::new(ErrorCode::NotFound, format!("{path}: no such file"))
                        .with_hint("use write_file to create new files"),
                )
            }
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolError::new(ErrorCode::Internal, format!("{path}: {e}")),
                )
            }
        };

        let lines: Vec<&str> = original.lines().collect();
        let at = match line {
            -1 => lines.len(),
            0 => 0,
            k if k as usize <= lines.len() => k as usize,
            k => {
                return ToolOutput::err(
                    &call.id,
                    ToolError::new(
                        ErrorCode::InvalidArgs,
                        format!("line {k} is past the end of the file ({} lines)", lines.len()),
                    )
                    .with_hint("use line=-1 to append"),
                )
            }
        };

        let mut updated: Vec<&str> = Vec::with_capacity(lines.len() + 1);
        updated.extend(&lines[..at]);
        updated.extend(text.lines());
        updated.extend(&lines[at..]);
        let mut out = updated.join("\n");
        if original.ends_with('\n') || original.is_empty() {
            out.push('\n');
        }

        match atomic_write(std::path::Path::new(&path), out.as_bytes()) {
            Ok(()) => {
                let where_desc = match line {
                    -1 => "at end".to_string(),
                    0 => "at start".to_string(),
                    k => format!("after line {k}"),
                };
                ToolOutput::ok(
                    &call.id,
                    format!("inserted {} lines {where_desc} of {path}", text.lines().count()),
                )
            }
            Err(e) => ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::Internal, format!("write failed: {e}")),
            ),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
