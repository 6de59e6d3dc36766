// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use super::read_file::{read_arg_spec, render_slice, ReadRequest};
use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::{ArgSpec, FieldKind};

/// Batch file read: several read requests answered in one tool result,
/// one section per file.  A failing request does not abort the batch; its
/// section carries the error text instead.
pub struct ReadManyTool;

#[async_trait]
impl Tool for ReadManyTool {
    fn name(&self) -> &str {
        "read_many"
    }

    fn description(&self) -> &str {
        "Read several file slices in one call. Each request accepts the same\n\
         parameters as read_file. Use this when exploring related files\n\
         instead of issuing many single reads."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new().field(
            "requests",
            true,
            FieldKind::RequestArray(Box::new(read_arg_spec())),
            "The file-read requests to execute in order",
        )
    }

    fn read_only(&self) -> bool {
        true
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let Some(requests) = call.args.get("requests").and_then(Value::as_array) else {
            return ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::InvalidArgs, "missing required parameter 'requests'"),
            );
        };
        if requests.is_empty() {
            return ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::InvalidArgs, "'requests' must not be empty"),
            );
        }

        let mut sections = Vec::with_capacity(requests.len());
        for args in requests {
            let req = ReadRequest::from_args(args);
            let body = match render_slice(&req) {
                Ok(content) => content,
                Err(e) => format!("error ({}): {}", e.code, e.message),
            };
            sections.push(format!("── {} ──\n{body}", req.path));
        }
        ToolOutput::ok(&call.id, sections.join("\n\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::Tool;

    fn ctx() -> ToolCtx {
        ToolCtx::new(std::env::temp_dir())
    }

    fn tmp_file(content: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn reads_multiple_files_with_headers() {
        let a = tmp_file("alpha\n");
        let b = tmp_file("beta\n");
        let call = ToolCall {
            id: "m1".into(),
            name: "read_many".into(),
            args: json!({"requests": [
                {"path": a.path().to_str().unwrap()},
                {"path": b.path().to_str().unwrap()},
            ]}),
        };
        let out = ReadManyTool.execute(&call, &ctx()).await;
        assert!(!out.is_error());
        assert!(out.content.contains("L1:alpha"));
        assert!(out.content.contains("L1:beta"));
        assert!(out.content.contains("── "));
    }

    #[tokio::test]
    async fn failing_request_does_not_abort_batch() {
        let a = tmp_file("ok\n");
        let call = ToolCall {
            id: "m1".into(),
            name: "read_many".into(),
            args: json!({"requests": [
                {"path": "/tmp/tiller_missing_xyz"},
                {"path": a.path().to_str().unwrap()},
            ]}),
        };
        let out = ReadManyTool.execute(&call, &ctx()).await;
        assert!(!out.is_error(), "batch itself succeeds");
        assert!(out.content.contains("error (not_found)"));
        assert!(out.content.contains("L1:ok"));
    }

    #[tokio::test]
    async fn empty_requests_is_invalid() {
        let call = ToolCall {
            id: "m1".into(),
            name: "read_many".into(),
            args: json!({"requests": []}),
        };
        let out = ReadManyTool.execute(&call, &ctx()).await;
        assert_eq!(out.error.as_ref().unwrap().code, ErrorCode::InvalidArgs);
    }
}
