// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::tool::{Tool, ToolCall, ToolCtx, ToolOutput};
use crate::validate::ArgSpec;

const DEFAULT_TAIL_LINES: usize = 40;

/// Report the runtime environment plus a tail of the session log, so the
/// model can orient itself without shelling out for `uname`/`pwd`.
pub struct SysContextTool {
    /// Session log to tail, when one exists.
    pub session_log: Option<PathBuf>,
}

#[async_trait]
impl Tool for SysContextTool {
    fn name(&self) -> &str {
        "sys_context"
    }

    fn description(&self) -> &str {
        "Report the runtime environment: OS, architecture, working directory\n\
         and the tail of the session log. Cheaper than exec for orientation."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new().integer(
            "tail_lines",
            false,
            1,
            1000,
            "Lines of session log to include (default 40)",
        )
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let tail_lines = call
            .args
            .get("tail_lines")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TAIL_LINES as u64) as usize;

        let mut content = format!(
            "os: {}\narch: {}\nworkdir: {}\n",
            std::env::consts::OS,
            std::env::consts::ARCH,
            ctx.workdir.display(),
        );

        if let Some(log) = &self.session_log {
            match std::fs::read_to_string(log) {
                Ok(text) => {
                    let lines: Vec<&str> = text.lines().collect();
                    let start = lines.len().saturating_sub(tail_lines);
                    content.push_str(&format!(
                        "\nsession log (last {} of {} lines):\n{}",
                        lines.len() - start,
                        lines.len(),
                        lines[start..].join("\n")
                    ));
                }
                Err(_) => content.push_str("\nsession log: (not available)"),
            }
        }
        ToolOutput::ok(&call.id, content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
