// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolCtx, ToolOutput};
use crate::validate::ArgSpec;

/// Caps and mode for one spawned subtask.
#[derive(Debug, Clone, Default)]
pub struct SubtaskSpec {
    pub task: String,
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u32>,
    pub timeout_sec: Option<u64>,
    pub approval_mode: Option<String>,
}

/// Runs a focused child engine over the same workspace.  Implemented by
/// the engine crate; the tool layer only carries the contract so it stays
/// independent of the orchestrator.
#[async_trait]
pub trait SubtaskRunner: Send + Sync {
    async fn run(&self, spec: SubtaskSpec) -> Result<String, crate::tool::ToolError>;
}

/// Delegate a focused task to a child engine and return its final text.
pub struct SubtaskTool {
    runner: Arc<dyn SubtaskRunner>,
}

impl SubtaskTool {
    pub fn new(runner: Arc<dyn SubtaskRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for SubtaskTool {
    fn name(&self) -> &str {
        "subtask"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent for a focused, self-contained task and return its\n\
         final text. The sub-agent has its own iteration/token/time caps and\n\
         cannot spawn further subtasks. Use it to keep exploratory work out\n\
         of the main context."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("task", true, "The task description for the sub-agent")
            .integer("max_iterations", false, 1, 1000, "Iteration cap for the sub-agent")
            .integer("max_tokens", false, 1, 10_000_000, "Token budget for the sub-agent")
            .integer("timeout_sec", false, 1, 3600, "Deadline for the sub-agent")
            .enumeration(
                "approval_mode",
                false,
                &["plan", "reject", "default", "auto-edit", "yolo"],
                "Approval mode for the sub-agent",
            )
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let spec = SubtaskSpec {
            task: call.args["task"].as_str().unwrap_or_default().to_string(),
            max_iterations: call
                .args
                .get("max_iterations")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            max_tokens: call
                .args
                .get("max_tokens")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            timeout_sec: call.args.get("timeout_sec").and_then(Value::as_u64),
            approval_mode: call
                .args
                .get("approval_mode")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        debug!(task = %spec.task, "spawning subtask");
        match self.runner.run(spec).await {
            Ok(text) if text.is_empty() => {
                ToolOutput::ok(&call.id, "(subtask produced no text output)")
            }
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
