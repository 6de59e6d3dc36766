// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call recovery from assistant text.
//!
//! Well-formed tool_calls arrays are the norm.  Some models write their
//! calls into the text stream instead; when the structured array is empty
//! the dispatcher attempts recovery in a fixed order:
//!
//! (a) the entire content is a JSON object with `{tool_calls: [...]}` or
//!     `{name, arguments}`,
//! (b) the entire content is a JSON array of `{name, arguments}` objects,
//! (c) concatenated JSON objects, found by depth-counted bracket scanning
//!     that respects string literals and escape sequences,
//! (d) XML-style `<tool_call><function=NAME><parameter=KEY>VALUE…` with
//!     depth-counted parameter tags (a missing closing tag turns the rest
//!     of the body into the value — truncated-output recovery),
//! (e) a lightweight `<function=NAME>{json}</function>` tag.
//!
//! Every parser here is total and side-effect-free: unknown or malformed
//! forms yield no tool calls and the content is surfaced verbatim.

use serde_json::Value;

use crate::tool::ToolCall;

/// Attempt to recover tool calls from assistant content.  Returns an empty
/// vector when no recognized form is present.
pub fn recover_tool_calls(content: &str) -> Vec<ToolCall> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    try_whole_json(trimmed)
        .or_else(|| try_concatenated_json(trimmed))
        .or_else(|| try_xml_tool_calls(trimmed))
        .or_else(|| try_function_tag(trimmed))
        .map(assign_ids)
        .unwrap_or_default()
}

/// A recovered (name, args) pair before ids are assigned.
struct Recovered {
    name: String,
    args: Value,
}

fn assign_ids(calls: Vec<Recovered>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .enumerate()
        .map(|(i, r)| ToolCall {
            id: format!("recovered_{i}"),
            name: r.name,
            args: r.args,
        })
        .collect()
}

/// (a) + (b): the whole content parses as one JSON value.
fn try_whole_json(text: &str) -> Option<Vec<Recovered>> {
    let v: Value = serde_json::from_str(text).ok()?;
    match v {
        Value::Object(ref obj) => {
            if let Some(Value::Array(items)) = obj.get("tool_calls") {
                let calls: Option<Vec<Recovered>> = items.iter().map(call_from_value).collect();
                return calls.filter(|c| !c.is_empty());
            }
            call_from_value(&v).map(|c| vec![c])
        }
        Value::Array(ref items) => {
            let calls: Option<Vec<Recovered>> = items.iter().map(call_from_value).collect();
            calls.filter(|c| !c.is_empty())
        }
        _ => None,
    }
}

/// Interpret one JSON value as a tool call: `{name, arguments}` directly,
/// or the wire shape `{function: {name, arguments}}`.  `arguments` may be
/// an object or a JSON-encoded string.
fn call_from_value(v: &Value) -> Option<Recovered> {
    let obj = v.as_object()?;
    let inner = obj
        .get("function")
        .and_then(Value::as_object)
        .unwrap_or(obj);
    let name = inner.get("name")?.as_str()?.to_string();
    if name.is_empty() {
        return None;
    }
    // An explicit `arguments` key is what distinguishes a tool call from an
    // arbitrary object that happens to carry a `name` field.
    let args = match inner.get("arguments")? {
        Value::Object(m) => Value::Object(m.clone()),
        Value::String(s) => serde_json::from_str(s).ok()?,
        Value::Null => Value::Object(Default::default()),
        _ => return None,
    };
    Some(Recovered { name, args })
}

/// (c): concatenated JSON objects — one per message — located by
/// depth-counted bracket scanning that respects string literals and
/// escape sequences.
fn try_concatenated_json(text: &str) -> Option<Vec<Recovered>> {
    let objects = scan_json_objects(text)?;
    if objects.len() < 2 {
        // A single object is case (a); reaching here means it failed there.
        return None;
    }
    let calls: Option<Vec<Recovered>> = objects.iter().map(call_from_value).collect();
    calls.filter(|c| !c.is_empty())
}

/// Split `text` into top-level JSON objects.  Returns `None` when anything
/// other than whitespace separates or surrounds them, or when an object
/// fails to parse.
fn scan_json_objects(text: &str) -> Option<Vec<Value>> {
    let mut objects = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c != '{' {
            return None;
        }
        let end = object_end(text, i)?;
        let v: Value = serde_json::from_str(&text[i..=end]).ok()?;
        objects.push(v);
        i = end + 1;
    }
    if objects.is_empty() {
        None
    } else {
        Some(objects)
    }
}

/// Index of the `}` closing the object that starts at `start`, honoring
/// strings and escapes.
fn object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices().skip_while(|(i, _)| *i < start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// (d): XML-style tool calls.
fn try_xml_tool_calls(text: &str) -> Option<Vec<Recovered>> {
    let mut calls = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("<tool_call>") {
        let body_start = start + "<tool_call>".len();
        let (body, next) = match rest[body_start..].find("</tool_call>") {
            Some(end) => (
                &rest[body_start..body_start + end],
                &rest[body_start + end + "</tool_call>".len()..],
            ),
            // Truncated output: the rest of the text is the body.
            None => (&rest[body_start..], ""),
        };
        calls.push(parse_function_body(body)?);
        rest = next;
    }
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Parse `<function=NAME><parameter=KEY>VALUE</parameter>…</function>`.
fn parse_function_body(body: &str) -> Option<Recovered> {
    let fn_start = body.find("<function=")?;
    let after = &body[fn_start + "<function=".len()..];
    let name_end = after.find('>')?;
    let name = after[..name_end].trim().to_string();
    if name.is_empty() {
        return None;
    }
    let mut params_text = &after[name_end + 1..];
    if let Some(end) = params_text.rfind("</function>") {
        params_text = &params_text[..end];
    }

    let mut args = serde_json::Map::new();
    let mut rest = params_text;
    while let Some(p_start) = rest.find("<parameter=") {
        let after_p = &rest[p_start + "<parameter=".len()..];
        let key_end = after_p.find('>')?;
        let key = after_p[..key_end].trim().to_string();
        let value_text = &after_p[key_end + 1..];
        let (value, next) = parameter_value(value_text);
        args.insert(key, coerce_value(value));
        rest = next;
    }
    Some(Recovered {
        name,
        args: Value::Object(args),
    })
}

/// Extract one parameter value with depth-counted `<parameter=` /
/// `</parameter>` tags, so values may contain literal inner parameter
/// tags.  A missing closing tag consumes the remainder of the body
/// (truncated-output recovery).
fn parameter_value(text: &str) -> (&str, &str) {
    let mut depth = 1i32;
    let mut i = 0;
    while i < text.len() {
        if text[i..].starts_with("<parameter=") {
            depth += 1;
            i += "<parameter=".len();
        } else if text[i..].starts_with("</parameter>") {
            depth -= 1;
            if depth == 0 {
                return (&text[..i], &text[i + "</parameter>".len()..]);
            }
            i += "</parameter>".len();
        } else {
            // Advance one char (UTF-8 safe).
            i += text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        }
    }
    (text, "")
}

/// Parameter values are strings on the wire; numbers, booleans and JSON
/// structures are coerced when they parse cleanly.
fn coerce_value(text: &str) -> Value {
    let t = text.trim();
    serde_json::from_str::<Value>(t).unwrap_or_else(|_| Value::String(t.to_string()))
}

/// (e): `<function=NAME>{json}</function>`.
fn try_function_tag(text: &str) -> Option<Vec<Recovered>> {
    let start = text.find("<function=")?;
    let after = &text[start + "<function=".len()..];
    let name_end = after.find('>')?;
    let name = after[..name_end].trim().to_string();
    if name.is_empty() {
        return None;
    }
    let body = &after[name_end + 1..];
    let body = body
        .rfind("</function>")
        .map(|end| &body[..end])
        .unwrap_or(body);
    let args: Value = serde_json::from_str(body.trim()).ok()?;
    if !args.is_object() {
        return None;
    }
    Some(vec![Recovered { name, args }])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── (a) whole-content JSON object ─────────────────────────────────────────

    #[test]
    fn whole_object_with_tool_calls_array() {
        let content = r#"{"tool_calls": [{"name": "list_dir", "arguments": {"path": "."}}]}"#;
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_dir");
        assert_eq!(calls[0].args["path"], ".");
    }

    #[test]
    fn whole_object_name_arguments() {
        let content = r#"{"name": "read_file", "arguments": {"path": "a.txt"}}"#;
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
    }

    #[test]
    fn string_encoded_arguments_decoded() {
        let content = r#"{"name": "read_file", "arguments": "{\"path\": \"a.txt\"}"}"#;
        let calls = recover_tool_calls(content);
        assert_eq!(calls[0].args["path"], "a.txt");
    }

    #[test]
    fn wire_shape_function_wrapper_accepted() {
        let content = r#"{"function": {"name": "exec", "arguments": {"command": "ls"}}}"#;
        let calls = recover_tool_calls(content);
        assert_eq!(calls[0].name, "exec");
    }

    // ── (b) whole-content JSON array ──────────────────────────────────────────

    #[test]
    fn whole_array_of_calls() {
        let content = r#"[{"name": "a_tool", "arguments": {}}, {"name": "b_tool", "arguments": {"x": 1}}]"#;
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "b_tool");
        assert_eq!(calls[1].args["x"], 1);
    }

    #[test]
    fn array_with_non_call_element_yields_nothing() {
        let content = r#"[{"name": "a_tool", "arguments": {}}, {"foo": 1}]"#;
        assert!(recover_tool_calls(content).is_empty());
    }

    // ── (c) concatenated JSON objects ─────────────────────────────────────────

    #[test]
    fn concatenated_objects_scanned_by_depth() {
        let content = "{\"name\": \"a_tool\", \"arguments\": {}}\n{\"name\": \"b_tool\", \"arguments\": {\"n\": 2}}";
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a_tool");
        assert_eq!(calls[1].args["n"], 2);
    }

    #[test]
    fn brace_inside_string_does_not_confuse_scanner() {
        let content = r#"{"name": "exec", "arguments": {"command": "echo '}'"}}
{"name": "list_dir", "arguments": {"path": "."}}"#;
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args["command"], "echo '}'");
    }

    #[test]
    fn escaped_quote_inside_string_handled() {
        let content = "{\"name\": \"exec\", \"arguments\": {\"command\": \"echo \\\"}\\\"\"}}\n{\"name\": \"list_dir\", \"arguments\": {}}";
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn trailing_prose_after_objects_yields_nothing() {
        let content = "{\"name\": \"a_tool\", \"arguments\": {}} and then some text";
        assert!(recover_tool_calls(content).is_empty());
    }

    // ── (d) XML-style tool calls ──────────────────────────────────────────────

    #[test]
    fn xml_tool_call_with_parameters() {
        let content = "<tool_call><function=read_file><parameter=path>src/main.rs</parameter><parameter=offset>10</parameter></function></tool_call>";
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].args["path"], "src/main.rs");
        assert_eq!(calls[0].args["offset"], 10);
    }

    #[test]
    fn xml_nested_parameter_tags_in_value() {
        let content = "<tool_call><function=write_file><parameter=content>outer <parameter=inner>x</parameter> tail</parameter><parameter=path>f</parameter></function></tool_call>";
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].args["content"],
            "outer <parameter=inner>x</parameter> tail"
        );
        assert_eq!(calls[0].args["path"], "f");
    }

    #[test]
    fn xml_missing_closing_tag_takes_remainder() {
        // Truncated model output: no </parameter>, no </function>.
        let content = "<tool_call><function=write_file><parameter=path>f.txt</parameter><parameter=content>line one\nline two";
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["content"], "line one\nline two");
    }

    #[test]
    fn xml_multiple_tool_calls() {
        let content = "<tool_call><function=a_tool></function></tool_call><tool_call><function=b_tool><parameter=x>1</parameter></function></tool_call>";
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "b_tool");
    }

    // ── (e) function tag with JSON body ───────────────────────────────────────

    #[test]
    fn function_tag_with_json_body() {
        let content = r#"<function=grep>{"pattern": "TODO", "path": "src"}</function>"#;
        let calls = recover_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "grep");
        assert_eq!(calls[0].args["pattern"], "TODO");
    }

    // ── Fallthrough ───────────────────────────────────────────────────────────

    #[test]
    fn plain_prose_yields_nothing() {
        assert!(recover_tool_calls("I will now read the file.").is_empty());
        assert!(recover_tool_calls("").is_empty());
    }

    #[test]
    fn arbitrary_json_object_yields_nothing() {
        assert!(recover_tool_calls(r#"{"result": "done", "count": 3}"#).is_empty());
    }

    #[test]
    fn recovered_ids_are_unique() {
        let content = json!([
            {"name": "a_tool", "arguments": {}},
            {"name": "b_tool", "arguments": {}},
        ])
        .to_string();
        let calls = recover_tool_calls(&content);
        assert_ne!(calls[0].id, calls[1].id);
    }
}
