// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{validate::ArgSpec, CancelToken};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// Structured error kind carried through tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgs,
    NotFound,
    Conflict,
    Blocked,
    Permission,
    Timeout,
    Transient,
    Internal,
    Validation,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgs => "invalid_args",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Blocked => "blocked",
            ErrorCode::Permission => "permission",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Transient => "transient",
            ErrorCode::Internal => "internal",
            ErrorCode::Validation => "validation",
        }
    }

    /// Timeouts and transient failures may be retried by the caller; the
    /// engine never auto-retries them inside tools.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::Transient)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured tool failure.  Never thrown out of the dispatcher; always
/// materialized as a tool message so the model can recover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub retryable: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            retryable: code.retryable(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// The text form fed back to the model.
    pub fn render(&self) -> String {
        serde_json::to_string(&serde_json::json!({ "error": self }))
            .unwrap_or_else(|_| format!("error ({}): {}", self.code, self.message))
    }
}

/// The result of executing (or replaying) one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Success text, or the rendered structured error.
    pub content: String,
    pub error: Option<ToolError>,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            error: None,
        }
    }

    pub fn err(call_id: impl Into<String>, error: ToolError) -> Self {
        Self {
            call_id: call_id.into(),
            content: error.render(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Which stream a live exec chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// One chunk of live output from a running tool, surfaced through the
/// `tool_stream` callback path.
#[derive(Debug, Clone)]
pub struct ToolStreamChunk {
    pub call_id: String,
    pub stream: StdStream,
    pub chunk: String,
}

/// Per-turn execution context handed to every tool.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub cancel: CancelToken,
    /// Live stdout/stderr chunks from running tools; `None` when no
    /// consumer is interested.
    pub stream: Option<mpsc::Sender<ToolStreamChunk>>,
    /// The session working root.
    pub workdir: PathBuf,
}

impl ToolCtx {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            cancel: CancelToken::new(),
            stream: None,
            workdir,
        }
    }
}

/// Trait every builtin tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Declarative argument spec: single source of truth for validation and
    /// the JSON Schema advertised to the model.
    fn arg_spec(&self) -> ArgSpec;

    /// True when this tool performs no side effects.
    fn read_only(&self) -> bool {
        false
    }

    /// True when results may be served from the read cache.  Only file
    /// read, batch file read and directory list qualify.
    fn cacheable(&self) -> bool {
        false
    }

    /// Paths this call would mutate, for checkpointing and cache
    /// invalidation.  Empty for read-only tools and exec.
    fn mutated_paths(&self, _args: &Value) -> Vec<String> {
        Vec::new()
    }

    /// Execute the tool.  Failures are returned as [`ToolOutput::err`],
    /// never as panics or Err.
    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
