// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use tiller_vault::Vault;

use crate::tool::{ErrorCode, Tool, ToolCall, ToolCtx, ToolError, ToolOutput};
use crate::validate::ArgSpec;

/// Store a persistent note in the session vault.  Notes survive context
/// compaction: the model can recover them later with vault_search.
pub struct VaultNoteTool {
    vault: Arc<Mutex<Vault>>,
}

impl VaultNoteTool {
    pub fn new(vault: Arc<Mutex<Vault>>) -> Self {
        Self { vault }
    }
}

#[async_trait]
impl Tool for VaultNoteTool {
    fn name(&self) -> &str {
        "vault_note"
    }

    fn description(&self) -> &str {
        "Save a persistent note under a key. Notes survive context\n\
         compaction — record decisions, findings and constraints you will\n\
         need later. Writing an existing key supersedes it (history kept)."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("key", true, "Stable identifier for this note")
            .string("value", true, "The note content")
            .string("kind", false, "Entry kind, e.g. note / decision / todo (default note)")
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let key = call.args["key"].as_str().unwrap_or_default();
        let value = call.args["value"].as_str().unwrap_or_default();
        let kind = call
            .args
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("note");

        let mut vault = self.vault.lock().unwrap();
        match vault.note(key, value, kind) {
            Ok(entry) => {
                let entry_key = entry.key.clone();
                let entry_kind = entry.kind.clone();
                ToolOutput::ok(
                    &call.id,
                    format!(
                        "saved '{}' ({}, version {})",
                        entry_key,
                        entry_kind,
                        vault.version_count(key) - 1
                    ),
                )
            }
            Err(e) => ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::Internal, format!("vault write failed: {e}")),
            ),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
