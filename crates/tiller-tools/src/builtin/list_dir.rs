// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use walkdir::WalkDir;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::ArgSpec;

const DEFAULT_MAX_ENTRIES: usize = 200;

/// List a directory, optionally recursively.  Directories carry a trailing
/// slash; entries are sorted for stable output.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory entries, sorted, directories marked with a trailing /.\n\
         recursive=true walks the whole subtree (VCS and build directories are\n\
         skipped). When the listing is truncated a notice shows how many\n\
         entries were omitted."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("path", true, "Directory to list")
            .integer("max_entries", false, 1, 500, "Entry cap (default 200)")
            .boolean("recursive", "Walk the whole subtree")
    }

    fn read_only(&self) -> bool {
        true
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let path = call.args["path"].as_str().unwrap_or_default().to_string();
        let max_entries = call
            .args
            .get("max_entries")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_ENTRIES as u64) as usize;
        let recursive = call
            .args
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let root = std::path::Path::new(&path);
        if !root.is_dir() {
            return ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::NotFound, format!("{path}: not a directory")),
            );
        }

        let mut entries: Vec<String> = Vec::new();
        let mut total = 0usize;
        let depth = if recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_ignored(e.file_name().to_string_lossy().as_ref()))
        {
            let Ok(entry) = entry else { continue };
            total += 1;
            if entries.len() >= max_entries {
                continue; // keep counting for the truncation notice
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            if entry.file_type().is_dir() {
                entries.push(format!("{rel}/"));
            } else {
                entries.push(rel);
            }
        }

        let mut content = entries.join("\n");
        if content.is_empty() {
            content = "(empty)".into();
        }
        if total > max_entries {
            content.push_str(&format!(
                "\n...[{} entries omitted of {total}; raise max_entries or narrow the path]",
                total - max_entries
            ));
        }
        ToolOutput::ok(&call.id, content)
    }
}

/// Directories never worth listing for the model.
fn is_ignored(name: &str) -> bool {
    matches!(name, ".git" | "target" | "node_modules" | ".venv" | "__pycache__")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
