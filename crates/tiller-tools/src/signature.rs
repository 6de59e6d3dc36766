// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Canonical tool-call signatures.
//!
//! A signature is a normalized fingerprint of one tool call, used for
//! per-turn dedup, read caching and loop detection.  Two calls that would
//! do the same work must map to the same signature even when superficial
//! argument differences (pipe suffixes, pattern token order, paging noise)
//! differ.

use serde_json::Value;

/// Compute the canonical signature for a parsed tool call.
pub fn canonical_signature(name: &str, args: &Value) -> String {
    match name {
        "read_file" => format!(
            "read_file:{}",
            read_request_signature(args)
        ),
        "read_many" => {
            let requests = args
                .get("requests")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .map(read_request_signature)
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            format!("read_many:[{requests}]")
        }
        "list_dir" => format!(
            "list_dir:{}|{}|{}",
            str_arg(args, "path"),
            args.get("recursive").and_then(Value::as_bool).unwrap_or(false),
            args.get("max_entries").and_then(Value::as_i64).unwrap_or(0),
        ),
        "write_file" | "insert_file" => {
            format!("{name}:{}", str_arg(args, "path"))
        }
        "edit_range" => format!(
            "edit_range:{}|{}|{}",
            str_arg(args, "path"),
            args.get("start_line").and_then(Value::as_i64).unwrap_or(0),
            args.get("end_line").and_then(Value::as_i64).unwrap_or(0),
        ),
        "edit_text" => {
            let old = str_arg(args, "old_text");
            let prefix: String = old.chars().take(200).collect();
            format!("edit_text:{}|{prefix}", str_arg(args, "path"))
        }
        "apply_patch" => {
            let mut files: Vec<String> = args
                .get("files")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            files.sort();
            format!("apply_patch:[{}]", files.join(","))
        }
        "grep" => format!(
            "grep:{}|{}|{}",
            str_arg(args, "path"),
            str_arg(args, "include"),
            normalize_regex_pattern(&str_arg(args, "pattern")),
        ),
        "exec" => format!("exec:{}", normalize_exec_signature(&str_arg(args, "command"))),
        // All others: deep-stable JSON with lexicographically sorted keys.
        _ => format!("{name}:{}", stable_json(args)),
    }
}

/// Signature fragment for one file-read request: `(path, offset bucket,
/// search)`.  Offsets are bucketed by 200 lines so paging through a file
/// does not defeat loop detection, while genuinely different regions do.
fn read_request_signature(args: &Value) -> String {
    let offset = args.get("offset").and_then(Value::as_i64).unwrap_or(1);
    format!(
        "{}|{}|{}",
        str_arg(args, "path"),
        offset / 200,
        str_arg(args, "search"),
    )
}

fn str_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Lowercase the pattern, tokenize into word tokens of length ≥ 2,
/// de-duplicate, sort, and join with `|`.  Regex syntax noise (anchors,
/// quantifiers, alternation order) disappears; the content words remain.
pub fn normalize_regex_pattern(pattern: &str) -> String {
    let lower = pattern.to_lowercase();
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in lower.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens.retain(|t| t.len() >= 2);
    tokens.sort();
    tokens.dedup();
    tokens.join("|")
}

/// Pipe targets that only filter or duplicate output without changing what
/// the command does.
fn is_output_filter(segment: &str) -> bool {
    let s = segment.trim();
    s.starts_with("head") || s.starts_with("tail") || s.starts_with("tee") || s.starts_with("grep -v")
}

/// Normalize a shell command for signature purposes.
///
/// Trailing output-filter pipes (`| head`, `| tail`, `| grep -v`, `| tee`)
/// are stripped, and recognized test-runner invocations collapse to
/// `framework+filter` so re-runs with different output plumbing compare
/// equal.
pub fn normalize_exec_signature(command: &str) -> String {
    // Split on pipes outside quotes, then drop trailing filter segments.
    let segments = split_pipes(command);
    let mut keep = segments.len();
    while keep > 1 && is_output_filter(&segments[keep - 1]) {
        keep -= 1;
    }
    let stripped = segments[..keep].join("|");
    let stripped = stripped.trim().to_string();

    if let Some(sig) = test_runner_signature(&stripped) {
        return sig;
    }
    stripped
}

/// Split a command on `|` respecting single/double quotes.  `||` is kept
/// intact (it is control flow, not a pipe).
fn split_pipes(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '|' => {
                    if chars.peek() == Some(&'|') {
                        current.push('|');
                        current.push(chars.next().expect("peeked"));
                    } else {
                        segments.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            },
        }
    }
    segments.push(current);
    segments
}

/// Collapse recognized test-runner commands to `test:<framework>:<filter>`.
///
/// Recognized forms: `X test …`, `X artisan test --filter=Y`,
/// `pytest -k …`, `vitest -t …`, `cargo test <name>`,
/// `go test ./… -run <name>`.
fn test_runner_signature(command: &str) -> Option<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }

    // `X artisan test --filter=Y`
    if tokens.len() >= 3 && tokens[1] == "artisan" && tokens[2] == "test" {
        let filter = flag_value(&tokens[3..], "--filter");
        return Some(format!("test:artisan:{filter}"));
    }

    match tokens[0] {
        "pytest" => {
            let filter = flag_value(&tokens[1..], "-k");
            Some(format!("test:pytest:{filter}"))
        }
        "vitest" => {
            let filter = flag_value(&tokens[1..], "-t");
            Some(format!("test:vitest:{filter}"))
        }
        "cargo" if tokens.get(1) == Some(&"test") => {
            let name = tokens
                .get(2..)
                .unwrap_or(&[])
                .iter()
                .find(|t| !t.starts_with('-'))
                .unwrap_or(&"");
            Some(format!("test:cargo:{name}"))
        }
        "go" if tokens.get(1) == Some(&"test") => {
            let filter = flag_value(&tokens[2..], "-run");
            Some(format!("test:go:{filter}"))
        }
        runner if tokens.get(1) == Some(&"test") => {
            // `npm test -- --filter=X`, `yarn test`, etc.
            let rest = tokens[2..]
                .iter()
                .filter(|t| **t != "--")
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            Some(format!("test:{runner}:{rest}"))
        }
        _ => None,
    }
}

/// Value of `--flag=x`, `--flag x`, or `-f x` within `tokens`.
fn flag_value(tokens: &[&str], flag: &str) -> String {
    let eq_prefix = format!("{flag}=");
    for (i, t) in tokens.iter().enumerate() {
        if let Some(v) = t.strip_prefix(&eq_prefix) {
            return v.to_string();
        }
        if *t == flag {
            return tokens.get(i + 1).copied().unwrap_or("").to_string();
        }
    }
    String::new()
}

/// Deep-stable serialization: objects with lexicographically sorted keys.
pub fn stable_json(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).expect("string"), stable_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(stable_json).collect();
            format!("[{}]", body.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serialization cannot fail"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── exec normalization ────────────────────────────────────────────────────

    #[test]
    fn exec_signature_equivalence_across_output_pipes() {
        // tee and head suffixes are output plumbing, not different work.
        assert_eq!(
            normalize_exec_signature("npm test -- --filter=X | tee /tmp/a"),
            normalize_exec_signature("npm test -- --filter=X | head -n 40"),
        );
    }

    #[test]
    fn exec_strips_stacked_filter_pipes() {
        assert_eq!(
            normalize_exec_signature("make build | grep -v warning | tail -20"),
            "make build"
        );
    }

    #[test]
    fn exec_keeps_meaningful_pipes() {
        let sig = normalize_exec_signature("ps aux | awk '{print $2}'");
        assert!(sig.contains("awk"), "meaningful pipe must survive: {sig}");
    }

    #[test]
    fn exec_does_not_split_logical_or() {
        let sig = normalize_exec_signature("make || echo failed");
        assert!(sig.contains("||"));
        assert!(sig.contains("echo failed"));
    }

    #[test]
    fn exec_pipe_inside_quotes_is_not_split() {
        let sig = normalize_exec_signature("echo 'a | head' ");
        assert!(sig.contains("a | head"));
    }

    // ── test-runner collapse ──────────────────────────────────────────────────

    #[test]
    fn npm_test_collapses_to_framework_filter() {
        assert_eq!(
            normalize_exec_signature("npm test -- --filter=X"),
            "test:npm:--filter=X"
        );
    }

    #[test]
    fn pytest_k_filter_recognized() {
        assert_eq!(
            normalize_exec_signature("pytest -k test_login"),
            "test:pytest:test_login"
        );
    }

    #[test]
    fn vitest_t_filter_recognized() {
        assert_eq!(
            normalize_exec_signature("vitest -t 'renders'"),
            "test:vitest:'renders'"
        );
    }

    #[test]
    fn cargo_test_name_recognized() {
        assert_eq!(
            normalize_exec_signature("cargo test compaction"),
            "test:cargo:compaction"
        );
    }

    #[test]
    fn go_test_run_recognized() {
        assert_eq!(
            normalize_exec_signature("go test ./... -run TestRetry"),
            "test:go:TestRetry"
        );
    }

    #[test]
    fn artisan_test_filter_recognized() {
        assert_eq!(
            normalize_exec_signature("php artisan test --filter=UserTest"),
            "test:artisan:UserTest"
        );
    }

    // ── regex pattern normalization ───────────────────────────────────────────

    #[test]
    fn pattern_tokens_lowercased_sorted_deduped() {
        assert_eq!(
            normalize_regex_pattern("Foo.*Bar|foo"),
            "bar|foo"
        );
    }

    #[test]
    fn pattern_short_tokens_dropped() {
        // one-char tokens are noise
        assert_eq!(normalize_regex_pattern("a|bc|d"), "bc");
    }

    #[test]
    fn pattern_syntax_noise_ignored() {
        assert_eq!(
            normalize_regex_pattern(r"^fn\s+main\("),
            normalize_regex_pattern("main fn")
        );
    }

    // ── per-tool signatures ───────────────────────────────────────────────────

    #[test]
    fn read_file_offset_buckets_by_200() {
        let a = canonical_signature("read_file", &json!({"path": "x", "offset": 1}));
        let b = canonical_signature("read_file", &json!({"path": "x", "offset": 199}));
        let c = canonical_signature("read_file", &json!({"path": "x", "offset": 401}));
        assert_eq!(a, b, "same bucket");
        assert_ne!(a, c, "different bucket");
    }

    #[test]
    fn patch_signature_is_sorted_file_list() {
        let a = canonical_signature("apply_patch", &json!({"files": ["b.rs", "a.rs"]}));
        let b = canonical_signature("apply_patch", &json!({"files": ["a.rs", "b.rs"]}));
        assert_eq!(a, b);
    }

    #[test]
    fn edit_text_uses_first_200_chars_of_old_text() {
        let long = "x".repeat(500);
        let a = canonical_signature(
            "edit_text",
            &json!({"path": "f", "old_text": long.clone() + "A"}),
        );
        let b = canonical_signature("edit_text", &json!({"path": "f", "old_text": long + "B"}));
        assert_eq!(a, b, "differences past 200 chars do not matter");
    }

    #[test]
    fn write_signature_is_path_only() {
        let a = canonical_signature("write_file", &json!({"path": "f", "content": "one"}));
        let b = canonical_signature("write_file", &json!({"path": "f", "content": "two"}));
        assert_eq!(a, b);
    }

    #[test]
    fn fallback_signature_is_key_order_independent() {
        let a = canonical_signature("vault_note", &json!({"key": "k", "value": "v"}));
        let b = canonical_signature("vault_note", &json!({"value": "v", "key": "k"}));
        assert_eq!(a, b);
    }

    #[test]
    fn read_many_signature_lists_requests() {
        let sig = canonical_signature(
            "read_many",
            &json!({"requests": [{"path": "a"}, {"path": "b", "offset": 300}]}),
        );
        assert!(sig.contains("a|0|"));
        assert!(sig.contains("b|1|"));
    }

    #[test]
    fn stable_json_sorts_nested_objects() {
        let a = stable_json(&json!({"b": {"z": 1, "a": 2}, "a": [3, 4]}));
        let b = stable_json(&json!({"a": [3, 4], "b": {"a": 2, "z": 1}}));
        assert_eq!(a, b);
    }
}
