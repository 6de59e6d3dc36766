// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use tiller_vault::Vault;

use crate::tool::{Tool, ToolCall, ToolCtx, ToolOutput};
use crate::validate::ArgSpec;

const DEFAULT_LIMIT: usize = 10;

/// Substring search over the session vault.
pub struct VaultSearchTool {
    vault: Arc<Mutex<Vault>>,
}

impl VaultSearchTool {
    pub fn new(vault: Arc<Mutex<Vault>>) -> Self {
        Self { vault }
    }
}

#[async_trait]
impl Tool for VaultSearchTool {
    fn name(&self) -> &str {
        "vault_search"
    }

    fn description(&self) -> &str {
        "Search saved vault notes by substring (keys and values).\n\
         Returns the latest entry per key, newest first."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("query", true, "Substring to search for")
            .integer("limit", false, 1, 50, "Result cap (default 10)")
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let query = call.args["query"].as_str().unwrap_or_default();
        let limit = call
            .args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_LIMIT as u64) as usize;

        let vault = self.vault.lock().unwrap();
        let hits = vault.search(query, limit);
        if hits.is_empty() {
            return ToolOutput::ok(&call.id, format!("no vault entries matching '{query}'"));
        }
        let body: Vec<String> = hits
            .iter()
            .map(|e| format!("[{}] {} — {}", e.kind, e.key, e.value))
            .collect();
        ToolOutput::ok(&call.id, body.join("\n"))
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

    #[tokio::test]
    async fn finds_matching_notes() {
        let vault = Arc::new(Mutex::new(Vault::in_memory()));
        vault
            .lock()
            .unwrap()
            .note("db", "uses postgres 16", "note")
            .unwrap();
        vault
            .lock()
            .unwrap()
            .note("ui", "react frontend", "note")
            .unwrap();

        let t = VaultSearchTool::new(vault);
        let call = ToolCall {
            id: "q1".into(),
            name: "vault_search".into(),
            args: json!({"query": "postgres"}),
        };
        let out = t.execute(&call, &ctx()).await;
        assert!(out.content.contains("db"));
        assert!(!out.content.contains("react"));
    }

    #[tokio::test]
    async fn empty_result_reports_cleanly() {
        let t = VaultSearchTool::new(Arc::new(Mutex::new(Vault::in_memory())));
        let call = ToolCall {
            id: "q1".into(),
            name: "vault_search".into(),
            args: json!({"query": "absent"}),
        };
        let out = t.execute(&call, &ctx()).await;
        assert!(!out.is_error());
        assert!(out.content.contains("no vault entries"));
    }

    #[tokio::test]
    async fn limit_caps_results() {
        let vault = Arc::new(Mutex::new(Vault::in_memory()));
        for i in 0..20 {
            vault
                .lock()
                .unwrap()
                .note(format!("k{i}"), "shared needle", "note")
                .unwrap();
        }
        let t = VaultSearchTool::new(vault);
        let call = ToolCall {
            id: "q1".into(),
            name: "vault_search".into(),
            args: json!({"query": "needle", "limit": 5}),
        };
        let out = t.execute(&call, &ctx()).await;
        assert_eq!(out.content.lines().count(), 5);
    }
}
