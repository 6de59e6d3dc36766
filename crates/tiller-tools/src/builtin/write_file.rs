// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use tiller_vault::atomic_write;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::ArgSpec;

/// Create or replace a file.  Overwriting an existing file requires the
/// explicit `overwrite` flag so the model cannot clobber content it never
/// read.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed.\n\
         Refuses to overwrite an existing file unless overwrite=true —\n\
         prefer edit_text / edit_range for modifying existing files."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("path", true, "Target file path")
            .string("content", true, "Full file content to write")
            .boolean("overwrite", "Replace an existing file (default false)")
    }

    fn mutated_paths(&self, args: &Value) -> Vec<String> {
        args.get("path")
            .and_then(Value::as_str)
            .map(|p| vec![p.to_string()])
            .unwrap_or_default()
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let path = call.args["path"].as_str().unwrap_or_default().to_string();
        let content = call.args["content"].as_str().unwrap_or_default();
        let overwrite = call
            .args
            .get("overwrite")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let target = std::path::Path::new(&path);
        if target.exists() && !overwrite {
            return ToolOutput::err(
                &call.id,
                ToolError::new(
                    ErrorCode::Conflict,
                    format!("{path} already exists"),
                )
                .with_hint("read the file first, then pass overwrite=true or use edit_text"),
            );
        }

        debug!(path = %path, bytes = content.len(), "write_file");
        match atomic_write(target, content.as_bytes()) {
            Ok(()) => ToolOutput::ok(
                &call.id,
                format!("wrote {} bytes to {path}", content.len()),
            ),
            Err(e) => ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::Internal, format!("write failed: {e}")),
            ),
        }
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

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "w1".into(),
            name: "write_file".into(),
            args,
        }
    }

    #[tokio::test]
    async fn writes_new_file_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/deep/new.txt");
        let out = WriteFileTool
            .execute(
                &call(json!({"path": path.to_str().unwrap(), "content": "hello"})),
                &ctx(),
            )
            .await;
        assert!(!out.is_error(), "{}", out.content);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn refuses_overwrite_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "original").unwrap();
        let out = WriteFileTool
            .execute(
                &call(json!({"path": path.to_str().unwrap(), "content": "new"})),
                &ctx(),
            )
            .await;
        assert_eq!(out.error.as_ref().unwrap().code, ErrorCode::Conflict);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }

    #[tokio::test]
    async fn overwrites_with_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "original").unwrap();
        let out = WriteFileTool
            .execute(
                &call(json!({"path": path.to_str().unwrap(), "content": "new", "overwrite": true})),
                &ctx(),
            )
            .await;
        assert!(!out.is_error());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn mutated_paths_reports_target() {
        let paths = WriteFileTool.mutated_paths(&json!({"path": "/x/y.txt", "content": ""}));
        assert_eq!(paths, vec!["/x/y.txt"]);
    }
}
