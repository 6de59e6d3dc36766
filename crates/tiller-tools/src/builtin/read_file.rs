// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::{ArgSpec, FieldKind};

/// Default number of lines returned when the caller does not specify a
/// limit.  Kept small to avoid flooding the model context on the first
/// read; the model paginates with offset + limit to get more.
pub(crate) const DEFAULT_LINE_LIMIT: usize = 200;

/// Hard byte ceiling applied in addition to the line limit.  Whichever
/// constraint is hit first determines where the output is cut.
pub(crate) const DEFAULT_MAX_BYTES: usize = 20_000;

/// Advertised schema bound for `limit`; explicit callers may go up to the
/// hard cap of 2000.
const SCHEMA_LINE_LIMIT: i64 = 240;

/// Options for one file-read request, shared with the batch reader.
#[derive(Debug, Clone)]
pub(crate) struct ReadRequest {
    pub path: String,
    pub offset: usize,
    pub limit: usize,
    pub max_bytes: usize,
    pub context: usize,
    pub search: Option<String>,
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Format {
    Plain,
    Numbered,
    Sparse,
}

impl ReadRequest {
    pub(crate) fn from_args(args: &Value) -> Self {
        let format = match args.get("format").and_then(Value::as_str) {
            Some("plain") => Format::Plain,
            Some("sparse") => Format::Sparse,
            _ => Format::Numbered,
        };
        Self {
            path: args
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            offset: args.get("offset").and_then(Value::as_u64).unwrap_or(1) as usize,
            limit: args
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize,
            max_bytes: args
                .get("max_bytes")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_MAX_BYTES as u64) as usize,
            context: args.get("context").and_then(Value::as_u64).unwrap_or(20) as usize,
            search: args
                .get("search")
                .and_then(Value::as_str)
                .map(str::to_string),
            format,
        }
    }
}

pub(crate) fn read_arg_spec() -> ArgSpec {
    ArgSpec::new()
        .string("path", true, "Absolute or relative path to the file")
        .integer("offset", false, 1, 1_000_000, "1-indexed line to start from (default 1)")
        .field(
            "limit",
            false,
            FieldKind::Integer {
                min: Some(1),
                max: Some(2000),
                schema_max: Some(SCHEMA_LINE_LIMIT),
            },
            "Maximum lines to return (default 200)",
        )
        .integer("context", false, 0, 80, "Context lines around a search match (default 20)")
        .integer("max_bytes", false, 256, 20_000, "Byte cap for the returned slice")
        .string("search", false, "Jump to the first line containing this text")
        .enumeration(
            "format",
            false,
            &["plain", "numbered", "sparse"],
            "Output format (default numbered)",
        )
}

/// Render one file slice.  Shared between `read_file` and `read_many`.
pub(crate) fn render_slice(req: &ReadRequest) -> Result<String, ToolError> {
    let bytes = std::fs::read(&req.path).map_err(|e| read_error(&req.path, e))?;
    let text = String::from_utf8_lossy(&bytes);
    let all_lines: Vec<&str> = text.lines().collect();
    let total = all_lines.len();

    // A search term overrides the offset: center the window on the first
    // matching line with `context` lines either side.
    let (start, limit) = match &req.search {
        Some(term) => {
            let needle = term.to_lowercase();
            match all_lines
                .iter()
                .position(|l| l.to_lowercase().contains(&needle))
            {
                Some(hit) => (
                    hit.saturating_sub(req.context),
                    req.context * 2 + 1,
                ),
                None => {
                    return Ok(format!(
                        "no line matching '{term}' in {} ({total} lines)",
                        req.path
                    ))
                }
            }
        }
        None => (req.offset.saturating_sub(1), req.limit),
    };

    let mut selected: Vec<String> = Vec::new();
    let mut byte_count = 0usize;
    let mut truncated_by_bytes = false;
    for (i, line) in all_lines.iter().enumerate().skip(start).take(limit) {
        let line_bytes = line.len() + 1;
        if byte_count + line_bytes > req.max_bytes {
            truncated_by_bytes = true;
            break;
        }
        match req.format {
            Format::Plain => selected.push((*line).to_string()),
            Format::Numbered => selected.push(format!("L{}:{}", i + 1, line)),
            Format::Sparse => {
                if !line.trim().is_empty() {
                    selected.push(format!("L{}:{}", i + 1, line));
                }
            }
        }
        byte_count += line_bytes;
    }

    let shown = match req.format {
        // Sparse skips blank lines, so count consumed input lines instead.
        Format::Sparse => all_lines
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .count()
            .min(limit),
        _ => selected.len(),
    };
    let last_shown = start + shown;
    let mut content = selected.join("\n");

    if last_shown < total {
        let reason = if truncated_by_bytes {
            format!("byte limit ({} B) reached", req.max_bytes)
        } else {
            format!("{} more lines", total - last_shown)
        };
        content.push_str(&format!(
            "\n...[{reason} — showing L{}-L{} of {total}; use offset={} to continue]",
            start + 1,
            last_shown.max(start + 1),
            last_shown + 1
        ));
    }

    Ok(content)
}

fn read_error(path: &str, e: std::io::Error) -> ToolError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            ToolError::new(ErrorCode::NotFound, format!("{path}: no such file"))
                .with_hint("check the path with list_dir")
        }
        std::io::ErrorKind::PermissionDenied => {
            ToolError::new(ErrorCode::Permission, format!("{path}: permission denied"))
        }
        _ => ToolError::new(ErrorCode::Internal, format!("{path}: read error: {e}")),
    }
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file slice. Default: 200 lines / 20 KB, whichever comes first.\n\
         Lines are formatted L{n}:content (1-indexed) unless format=plain.\n\
         Use search= to jump to the first matching line with context around it.\n\
         When more lines exist, a pagination notice shows the next offset.\n\
         Prefer grep to locate the right region first, then read only that\n\
         region with offset+limit instead of paging through whole files."
    }

    fn arg_spec(&self) -> ArgSpec {
        read_arg_spec()
    }

    fn read_only(&self) -> bool {
        true
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let req = ReadRequest::from_args(&call.args);
        debug!(path = %req.path, offset = req.offset, limit = req.limit, "read_file");
        match render_slice(&req) {
            Ok(content) => ToolOutput::ok(&call.id, content),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
