// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use similar::TextDiff;
use tracing::debug;

use tiller_vault::atomic_write;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::ArgSpec;

/// Replace one exact occurrence of `old_text` with `new_text`.
pub struct EditTextTool;

#[async_trait]
impl Tool for EditTextTool {
    fn name(&self) -> &str {
        "edit_text"
    }

    fn description(&self) -> &str {
        "Replace an exact text occurrence in a file.\n\
         old_text must appear exactly once — include enough surrounding\n\
         lines to make it unique. The result shows a unified diff of the\n\
         change."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("path", true, "File to edit")
            .string("old_text", true, "Exact text to replace (must be unique)")
            .string("new_text", true, "Replacement text")
    }

    fn mutated_paths(&self, args: &Value) -> Vec<String> {
        args.get("path")
            .and_then(Value::as_str)
            .map(|p| vec![p.to_string()])
            .unwrap_or_default()
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let path = call.args["path"].as_str().unwrap_or_default().to_string();
        let old_text = call.args["old_text"].as_str().unwrap_or_default();
        let new_text = call.args["new_text"].as_str().unwrap_or_default();

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

        let occurrences = original.matches(old_text).count();
        if occurrences == 0 {
            return ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::Conflict, "old_text not found in file")
                    .with_hint("read the current content first; it may have changed"),
            );
        }
        if occurrences > 1 {
            return ToolOutput::err(
                &call.id,
                ToolError::new(
                    ErrorCode::Conflict,
                    format!("old_text appears {occurrences} times; it must be unique"),
                )
                .with_hint("include more surrounding lines to disambiguate"),
            );
        }

        let updated = original.replacen(old_text, new_text, 1);
        if let Err(e) = atomic_write(std::path::Path::new(&path), updated.as_bytes()) {
            return ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::Internal, format!("write failed: {e}")),
            );
        }

        debug!(path = %path, "edit_text applied");
        let diff = TextDiff::from_lines(&original, &updated)
            .unified_diff()
            .context_radius(2)
            .to_string();
        ToolOutput::ok(&call.id, format!("edited {path}\n{diff}"))
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
            id: "e1".into(),
            name: "edit_text".into(),
            args,
        }
    }

    #[tokio::test]
    async fn replaces_unique_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "fn main() {\n    old();\n}\n").unwrap();
        let out = EditTextTool
            .execute(
                &call(json!({
                    "path": path.to_str().unwrap(),
                    "old_text": "    old();",
                    "new_text": "    new();",
                })),
                &ctx(),
            )
            .await;
        assert!(!out.is_error(), "{}", out.content);
        assert!(std::fs::read_to_string(&path).unwrap().contains("new();"));
        assert!(out.content.contains("-    old();"), "diff shown: {}", out.content);
        assert!(out.content.contains("+    new();"));
    }

    #[tokio::test]
    async fn missing_old_text_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "content\n").unwrap();
        let out = EditTextTool
            .execute(
                &call(json!({
                    "path": path.to_str().unwrap(),
                    "old_text": "absent",
                    "new_text": "x",
                })),
                &ctx(),
            )
            .await;
        assert_eq!(out.error.as_ref().unwrap().code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn ambiguous_old_text_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "dup\ndup\n").unwrap();
        let out = EditTextTool
            .execute(
                &call(json!({
                    "path": path.to_str().unwrap(),
                    "old_text": "dup",
                    "new_text": "x",
                })),
                &ctx(),
            )
            .await;
        let e = out.error.as_ref().unwrap();
        assert_eq!(e.code, ErrorCode::Conflict);
        assert!(e.message.contains("2 times"));
        // File untouched on conflict.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "dup\ndup\n");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let out = EditTextTool
            .execute(
                &call(json!({
                    "path": "/tmp/tiller_edit_missing_xyz",
                    "old_text": "a",
                    "new_text": "b",
                })),
                &ctx(),
            )
            .await;
        assert_eq!(out.error.as_ref().unwrap().code, ErrorCode::NotFound);
    }
}
