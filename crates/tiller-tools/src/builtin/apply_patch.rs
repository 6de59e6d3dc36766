// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use tiller_vault::atomic_write;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::{ArgSpec, FieldKind};

/// Apply a unified diff to files under the working root.
///
/// `diff --git` headers are the fast path; plain `---`/`+++` headers are
/// the fallback when no git header is present.  Patch paths containing
/// `..` or starting with `/` are rejected outright.
pub struct ApplyPatchTool;

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff (git format preferred) to files under the\n\
         working directory. files[] must list every file the patch touches.\n\
         Context lines are verified; a mismatch rejects the whole patch."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("patch", true, "Unified diff text")
            .field(
                "files",
                true,
                FieldKind::StringArray,
                "Relative paths of every file the patch touches",
            )
            .integer("strip", false, 0, 5, "Leading path components to strip (default auto)")
    }

    fn mutated_paths(&self, args: &Value) -> Vec<String> {
        args.get("files")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let patch_text = call.args["patch"].as_str().unwrap_or_default();
        let listed: Vec<String> = call
            .args
            .get("files")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let strip = call.args.get("strip").and_then(Value::as_u64).map(|s| s as usize);

        let file_patches = match parse_patch(patch_text, strip) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        if file_patches.is_empty() {
            return ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::InvalidArgs, "patch contains no file headers"),
            );
        }

        // Every parsed path must appear in the declared file list.
        for fp in &file_patches {
            if !listed.iter().any(|f| f == &fp.path) {
                return ToolOutput::err(
                    &call.id,
                    ToolError::new(
                        ErrorCode::Conflict,
                        format!("patch touches '{}' which is not listed in files[]", fp.path),
                    ),
                );
            }
        }

        // Two-phase apply: materialize every result first, then write, so a
        // context mismatch in the last hunk cannot leave a half-applied set.
        let mut results: Vec<(std::path::PathBuf, Option<String>)> = Vec::new();
        for fp in &file_patches {
            let target = ctx.workdir.join(&fp.path);
            let original = if fp.created {
                String::new()
            } else {
                match std::fs::read_to_string(&target) {
                    Ok(t) => t,
                    Err(e) => {
                        return ToolOutput::err(
                            &call.id,
                            ToolError::new(
                                ErrorCode::NotFound,
                                format!("{}: {e}", fp.path),
                            ),
                        )
                    }
                }
            };
            if fp.deleted {
                results.push((target, None));
                continue;
            }
            match apply_hunks(&original, &fp.hunks) {
                Ok(updated) => results.push((target, Some(updated))),
                Err(msg) => {
                    return ToolOutput::err(
                        &call.id,
                        ToolError::new(
                            ErrorCode::Conflict,
                            format!("{}: {msg}", fp.path),
                        )
                        .with_hint("re-read the file and regenerate the patch"),
                    )
                }
            }
        }

        let mut applied = Vec::new();
        for (target, content) in results {
            match content {
                Some(text) => {
                    if let Err(e) = atomic_write(&target, text.as_bytes()) {
                        return ToolOutput::err(
                            &call.id,
                            ToolError::new(ErrorCode::Internal, format!("write failed: {e}")),
                        );
                    }
                }
                None => {
                    if let Err(e) = std::fs::remove_file(&target) {
                        return ToolOutput::err(
                            &call.id,
                            ToolError::new(ErrorCode::Internal, format!("delete failed: {e}")),
                        );
                    }
                }
            }
            applied.push(target);
        }

        debug!(files = applied.len(), "patch applied");
        ToolOutput::ok(
            &call.id,
            format!(
                "patch applied to {} file(s): {}",
                applied.len(),
                file_patches
                    .iter()
                    .map(|f| f.path.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )
    }
}

// ─── Patch parsing ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FilePatch {
    path: String,
    created: bool,
    deleted: bool,
    hunks: Vec<Hunk>,
}

#[derive(Debug, Clone)]
struct Hunk {
    old_start: usize,
    lines: Vec<HunkLine>,
}

#[derive(Debug, Clone)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// Normalize a patch path: strip a/ b/ prefixes (git fast path) plus the
/// caller-requested component count, then reject escapes.
fn clean_path(raw: &str, strip: Option<usize>) -> Result<String, ToolError> {
    let mut path = raw.trim().to_string();
    if let Some(rest) = path.strip_prefix("a/").or_else(|| path.strip_prefix("b/")) {
        path = rest.to_string();
    } else if let Some(n) = strip {
        let parts: Vec<&str> = path.split('/').collect();
        if n < parts.len() {
            path = parts[n..].join("/");
        }
    }
    if path.starts_with('/') || path.split('/').any(|c| c == "..") {
        return Err(ToolError::new(
            ErrorCode::Blocked,
            format!("patch path '{raw}' escapes the working root"),
        ));
    }
    Ok(path)
}

fn parse_patch(text: &str, strip: Option<usize>) -> Result<Vec<FilePatch>, ToolError> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut lines = text.lines().peekable();
    let has_git_headers = text.lines().any(|l| l.starts_with("diff --git"));

    while let Some(line) = lines.next() {
        // Fast path: git-style headers.
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let raw = parts.get(1).or_else(|| parts.first()).copied().unwrap_or("");
            let path = clean_path(raw, strip)?;
            patches.push(FilePatch {
                path,
                created: false,
                deleted: false,
                hunks: Vec::new(),
            });
            continue;
        }
        if let Some(rest) = line.strip_prefix("--- ") {
            if has_git_headers {
                if rest.trim() == "/dev/null" {
                    if let Some(p) = patches.last_mut() {
                        p.created = true;
                    }
                }
                continue;
            }
            // Fallback: ---/+++ pairs define the file when diff --git is
            // absent.
            let old_is_null = rest.trim() == "/dev/null";
            let new_line = lines.next().unwrap_or_default();
            let Some(new_rest) = new_line.strip_prefix("+++ ") else {
                return Err(ToolError::new(
                    ErrorCode::InvalidArgs,
                    "malformed patch: '---' without matching '+++'",
                ));
            };
            let new_is_null = new_rest.trim() == "/dev/null";
            let raw = if new_is_null { rest } else { new_rest };
            let path = clean_path(raw, strip)?;
            patches.push(FilePatch {
                path,
                created: old_is_null,
                deleted: new_is_null,
                hunks: Vec::new(),
            });
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            if has_git_headers {
                if rest.trim() == "/dev/null" {
                    if let Some(p) = patches.last_mut() {
                        p.deleted = true;
                    }
                }
            }
            continue;
        }
        if let Some(header) = line.strip_prefix("@@ ") {
            let Some(patch) = patches.last_mut() else {
                return Err(ToolError::new(
                    ErrorCode::InvalidArgs,
                    "malformed patch: hunk before any file header",
                ));
            };
            let old_start = parse_hunk_old_start(header).ok_or_else(|| {
                ToolError::new(ErrorCode::InvalidArgs, format!("malformed hunk header: @@ {header}"))
            })?;
            let mut hunk = Hunk {
                old_start,
                lines: Vec::new(),
            };
            while let Some(next) = lines.peek() {
                let parsed = match next.chars().next() {
                    Some(' ') => Some(HunkLine::Context(next[1..].to_string())),
                    Some('-') if !next.starts_with("---") => {
                        Some(HunkLine::Remove(next[1..].to_string()))
                    }
                    Some('+') if !next.starts_with("+++") => {
                        Some(HunkLine::Add(next[1..].to_string()))
                    }
                    None => Some(HunkLine::Context(String::new())),
                    _ => None,
                };
                match parsed {
                    Some(hl) => {
                        hunk.lines.push(hl);
                        lines.next();
                    }
                    None => break,
                }
            }
            patch.hunks.push(hunk);
        }
    }
    Ok(patches)
}

/// Extract the old-file start line from `-l,c +l,c @@`.
fn parse_hunk_old_start(header: &str) -> Option<usize> {
    let minus = header.split_whitespace().find(|t| t.starts_with('-'))?;
    let nums = &minus[1..];
    let start = nums.split(',').next()?;
    start.parse().ok()
}

/// Apply hunks to `original`, verifying context and removed lines.
fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, String> {
    let had_trailing_newline = original.ends_with('\n') || original.is_empty();
    let old_lines: Vec<&str> = original.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(old_lines.len());
    let mut cursor = 0usize; // index into old_lines

    for (hi, hunk) in hunks.iter().enumerate() {
        // Hunk starts are 1-indexed; a start of 0 means an empty old file.
        let start = hunk.old_start.saturating_sub(1);
        if start < cursor {
            return Err(format!("hunk {} overlaps the previous hunk", hi + 1));
        }
        if start > old_lines.len() {
            return Err(format!("hunk {} starts past the end of the file", hi + 1));
        }
        out.extend(old_lines[cursor..start].iter().map(|s| s.to_string()));
        cursor = start;

        for hl in &hunk.lines {
            match hl {
                HunkLine::Context(expected) => {
                    let actual = old_lines.get(cursor).copied().unwrap_or_default();
                    if actual != expected {
                        return Err(format!(
                            "context mismatch at line {}: expected '{expected}', found '{actual}'",
                            cursor + 1
                        ));
                    }
                    out.push(expected.clone());
                    cursor += 1;
                }
                HunkLine::Remove(expected) => {
                    let actual = old_lines.get(cursor).copied().unwrap_or_default();
                    if actual != expected {
                        return Err(format!(
                            "removed line mismatch at line {}: expected '{expected}', found '{actual}'",
                            cursor + 1
                        ));
                    }
                    cursor += 1;
                }
                HunkLine::Add(text) => out.push(text.clone()),
            }
        }
    }
    out.extend(old_lines[cursor..].iter().map(|s| s.to_string()));

    let mut result = out.join("\n");
    if had_trailing_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
