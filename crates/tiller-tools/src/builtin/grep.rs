// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::Value;
use walkdir::WalkDir;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::ArgSpec;

const DEFAULT_MAX_RESULTS: usize = 50;

/// Files larger than this are skipped — grep output from generated or
/// bundled files is noise.
const MAX_FILE_BYTES: u64 = 1_000_000;

/// Regex search over a file or directory tree.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Regex search (case-insensitive) over a file or directory tree.\n\
         Results are path:line:content, capped at max_results.\n\
         include= filters files by glob, e.g. *.rs or src/*.toml."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("pattern", true, "Regular expression to search for")
            .string("path", true, "File or directory to search")
            .string("include", false, "Glob filter on file names, e.g. *.rs")
            .integer("max_results", false, 1, 100, "Match cap (default 50)")
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let pattern = call.args["pattern"].as_str().unwrap_or_default();
        let path = call.args["path"].as_str().unwrap_or_default().to_string();
        let include = call.args.get("include").and_then(Value::as_str);
        let max_results = call
            .args
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_RESULTS as u64) as usize;

        let re = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => re,
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolError::new(ErrorCode::InvalidArgs, format!("invalid pattern: {e}")),
                )
            }
        };
        let include_re = include.map(glob_to_regex);

        let root = std::path::Path::new(&path);
        if !root.exists() {
            return ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::NotFound, format!("{path}: no such path")),
            );
        }

        let mut matches: Vec<String> = Vec::new();
        let mut truncated = false;
        'outer: for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_ignored(e.file_name().to_string_lossy().as_ref()))
        {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            let display = if rel.is_empty() { path.clone() } else { rel.clone() };
            if let Some(inc) = &include_re {
                let name = entry.file_name().to_string_lossy();
                if !inc.is_match(&name) && !inc.is_match(&rel) {
                    continue;
                }
            }
            let Ok(text) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            for (ln, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    if matches.len() >= max_results {
                        truncated = true;
                        break 'outer;
                    }
                    matches.push(format!("{display}:{}:{}", ln + 1, line.trim_end()));
                }
            }
        }

        if matches.is_empty() {
            return ToolOutput::ok(&call.id, format!("no matches for '{pattern}' in {path}"));
        }
        let mut content = matches.join("\n");
        if truncated {
            content.push_str(&format!(
                "\n...[more matches exist; showing the first {max_results} — refine the pattern]"
            ));
        }
        ToolOutput::ok(&call.id, content)
    }
}

fn is_ignored(name: &str) -> bool {
    matches!(name, ".git" | "target" | "node_modules" | ".venv" | "__pycache__")
}

/// Convert a simple shell glob to a regex.  Only `*` and `?` are special.
fn glob_to_regex(pattern: &str) -> regex::Regex {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re).unwrap_or_else(|_| regex::Regex::new("$^").expect("static"))
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
            id: "g1".into(),
            name: "grep".into(),
            args,
        }
    }

    #[tokio::test]
    async fn finds_matches_with_path_line_format() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\nlet x = 1;\n").unwrap();
        let out = GrepTool
            .execute(
                &call(json!({"pattern": "fn main", "path": dir.path().to_str().unwrap()})),
                &ctx(),
            )
            .await;
        assert!(out.content.contains("a.rs:1:fn main() {}"), "{}", out.content);
    }

    #[tokio::test]
    async fn search_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "TODO: fix\n").unwrap();
        let out = GrepTool
            .execute(
                &call(json!({"pattern": "todo", "path": dir.path().to_str().unwrap()})),
                &ctx(),
            )
            .await;
        assert!(out.content.contains("TODO"));
    }

    #[tokio::test]
    async fn include_glob_filters_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "needle\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "needle\n").unwrap();
        let out = GrepTool
            .execute(
                &call(json!({
                    "pattern": "needle",
                    "path": dir.path().to_str().unwrap(),
                    "include": "*.rs",
                })),
                &ctx(),
            )
            .await;
        assert!(out.content.contains("a.rs"));
        assert!(!out.content.contains("b.txt"));
    }

    #[tokio::test]
    async fn max_results_truncates_with_notice() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..20).map(|i| format!("needle {i}\n")).collect();
        std::fs::write(dir.path().join("a.txt"), body).unwrap();
        let out = GrepTool
            .execute(
                &call(json!({
                    "pattern": "needle",
                    "path": dir.path().to_str().unwrap(),
                    "max_results": 5,
                })),
                &ctx(),
            )
            .await;
        assert_eq!(out.content.matches("needle").count(), 5);
        assert!(out.content.contains("more matches exist"));
    }

    #[tokio::test]
    async fn no_matches_reports_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "nothing\n").unwrap();
        let out = GrepTool
            .execute(
                &call(json!({"pattern": "absent_term", "path": dir.path().to_str().unwrap()})),
                &ctx(),
            )
            .await;
        assert!(!out.is_error());
        assert!(out.content.contains("no matches"));
    }

    #[tokio::test]
    async fn invalid_pattern_is_invalid_args() {
        let out = GrepTool
            .execute(&call(json!({"pattern": "(unclosed", "path": "/tmp"})), &ctx())
            .await;
        assert_eq!(out.error.as_ref().unwrap().code, ErrorCode::InvalidArgs);
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let out = GrepTool
            .execute(
                &call(json!({"pattern": "x", "path": "/tmp/tiller_grep_missing_xyz"})),
                &ctx(),
            )
            .await;
        assert_eq!(out.error.as_ref().unwrap().code, ErrorCode::NotFound);
    }
}
