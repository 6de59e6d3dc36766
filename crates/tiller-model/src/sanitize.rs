// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request sanitization applied immediately before transmit.
//!
//! Remote endpoints disagree on optional fields; the engine normalizes one
//! canonical body shape so every target receives a request it accepts:
//!
//! - role `developer` → `system`
//! - `max_completion_tokens` → `max_tokens`
//! - `stream_options.include_usage = true` on streaming requests
//! - `strict` flags stripped from tool schemas
//! - provider-specific optional fields not needed here stripped entirely

use serde_json::{json, Value};

/// Optional top-level fields some SDKs attach that no target here needs.
const STRIPPED_FIELDS: &[&str] = &[
    "parallel_tool_calls",
    "service_tier",
    "store",
    "metadata",
    "logprobs",
    "top_logprobs",
    "seed",
];

/// Normalize a chat-completion request body in place.
pub fn sanitize_request(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    // max_completion_tokens → max_tokens (keep an existing max_tokens).
    if let Some(v) = obj.remove("max_completion_tokens") {
        obj.entry("max_tokens").or_insert(v);
    }

    for field in STRIPPED_FIELDS {
        obj.remove(*field);
    }

    let streaming = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if streaming {
        obj.insert(
            "stream_options".to_string(),
            json!({ "include_usage": true }),
        );
    } else {
        obj.remove("stream_options");
    }

    if let Some(messages) = obj.get_mut("messages").and_then(Value::as_array_mut) {
        for m in messages {
            if m.get("role").and_then(Value::as_str) == Some("developer") {
                m["role"] = json!("system");
            }
        }
    }

    if let Some(tools) = obj.get_mut("tools").and_then(Value::as_array_mut) {
        for t in tools {
            if let Some(f) = t.get_mut("function").and_then(Value::as_object_mut) {
                f.remove("strict");
            }
            if let Some(t) = t.as_object_mut() {
                t.remove("strict");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
