// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use tiller_vault::atomic_write;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::ArgSpec;

/// Replace an inclusive 1-indexed line range with new content.
pub struct EditRangeTool;

#[async_trait]
impl Tool for EditRangeTool {
    fn name(&self) -> &str {
        "edit_range"
    }

    fn description(&self) -> &str {
        "Replace lines start_line..=end_line (1-indexed, inclusive) with the\n\
         replacement text. Read the file first so the line numbers are\n\
         current — they shift after every edit."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("path", true, "File to edit")
            .integer("start_line", true, 1, i64::MAX, "First line to replace (1-indexed)")
            .integer("end_line", true, 1, i64::MAX, "Last line to replace (inclusive)")
            .string("replacement", true, "Replacement text (may span multiple lines)")
    }

    fn mutated_paths(&self, args: &Value) -> Vec<String> {
        args.get("path")
            .and_then(Value::as_str)
            .map(|p| vec![p.to_string()])
            .unwrap_or_default()
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let path = call.args["path"].as_str().unwrap_or_default().to_string();
        let start = call.args["start_line"].as_i64().unwrap_or(1) as usize;
        let end = call.args["end_line"].as_i64().unwrap_or(0) as usize;
        let replacement = call.args["replacement"].as_str().unwrap_or_default();

        if end < start {
            return ToolOutput::err(
                &call.id,
                ToolError::new(
                    ErrorCode::InvalidArgs,
                    format!("end_line ({end}) must be >= start_line ({start})"),
                ),
            );
        }

        let original = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolOutput::err(
                    &call.id,
                    ToolError::new(ErrorCode::NotFound, format!("{path}: no such file")),
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
        if start > lines.len() {
            return ToolOutput::err(
                &call.id,
                ToolError::new(
                    ErrorCode::InvalidArgs,
                    format!("start_line {start} is past the end of the file ({} lines)", lines.len()),
                )
                .with_hint("use insert_file with line=-1 to append"),
            );
        }
        let end = end.min(lines.len());

        let mut updated: Vec<&str> = Vec::with_capacity(lines.len());
        updated.extend(&lines[..start - 1]);
        updated.extend(replacement.lines());
        updated.extend(&lines[end..]);
        let mut text = updated.join("\n");
        if original.ends_with('\n') {
            text.push('\n');
        }

        if let Err(e) = atomic_write(std::path::Path::new(&path), text.as_bytes()) {
            return ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::Internal, format!("write failed: {e}")),
            );
        }
        debug!(path = %path, start, end, "edit_range applied");
        ToolOutput::ok(
            &call.id,
            format!(
                "replaced lines {start}-{end} of {path} ({} replacement lines)",
                replacement.lines().count()
            ),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
