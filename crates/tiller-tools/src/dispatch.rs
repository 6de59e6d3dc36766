// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The tool dispatcher: validation, safety gating, guard bookkeeping,
//! dedup and sequential execution for one turn's tool calls.
//!
//! Errors never propagate out of `dispatch_turn` — every failure is
//! materialized as a tool output carrying a structured error, giving the
//! model a chance to recover.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use tiller_guard::{LoopLevel, ToolLoopGuard};
use tiller_vault::{MutationOp, ReplayStore};

use crate::{
    canonical_signature,
    registry::ToolRegistry,
    safety::SafetyGate,
    tool::{ErrorCode, ToolCall, ToolCtx, ToolError, ToolOutput},
};

/// Per-turn dispatch context.
pub struct TurnCtx {
    pub turn_index: u32,
    pub tool_ctx: ToolCtx,
}

/// The result of dispatching one turn.
pub struct DispatchOutcome {
    /// Tool outputs in the original call order; replays are byte-identical
    /// to their canonical.
    pub outputs: Vec<ToolOutput>,
    /// Highest loop level observed this turn.
    pub worst_loop_level: LoopLevel,
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    guard: Mutex<ToolLoopGuard>,
    safety: Arc<SafetyGate>,
    replay: Option<Mutex<ReplayStore>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        guard: ToolLoopGuard,
        safety: Arc<SafetyGate>,
        replay: Option<ReplayStore>,
    ) -> Self {
        Self {
            registry,
            guard: Mutex::new(guard),
            safety,
            replay: replay.map(Mutex::new),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn safety(&self) -> &Arc<SafetyGate> {
        &self.safety
    }

    /// True exactly once after a critical loop verdict.
    pub fn should_disable_tools_next_turn(&self) -> bool {
        self.guard.lock().unwrap().should_disable_tools_next_turn()
    }

    pub fn guard_stats(&self) -> tiller_guard::GuardStats {
        self.guard.lock().unwrap().stats()
    }

    /// Dispatch one turn's tool calls.
    ///
    /// Calls are grouped by canonical signature; the first call per
    /// signature is executed, subsequent ones replay the canonical result
    /// without re-running the handler.  Canonical calls run sequentially
    /// in the order the model produced them.
    pub async fn dispatch_turn(&self, calls: &[ToolCall], ctx: &TurnCtx) -> DispatchOutcome {
        let calls = normalize_call_ids(calls);

        let mut outputs: Vec<Option<ToolOutput>> = vec![None; calls.len()];
        let mut canonical_of: HashMap<String, usize> = HashMap::new();
        let mut worst = LoopLevel::None;

        for (i, call) in calls.iter().enumerate() {
            let signature = canonical_signature(&call.name, &call.args);

            if let Some(&ci) = canonical_of.get(&signature) {
                // Replay: identical content mapped to this call id.
                self.guard.lock().unwrap().note_replay();
                let canonical = outputs[ci].as_ref().expect("canonical completed earlier");
                debug!(call_id = %call.id, canonical_id = %canonical.call_id, "replaying deduplicated call");
                outputs[i] = Some(ToolOutput {
                    call_id: call.id.clone(),
                    content: canonical.content.clone(),
                    error: canonical.error.clone(),
                });
                continue;
            }
            canonical_of.insert(signature.clone(), i);

            let (output, level) = self.execute_canonical(call, &signature, ctx).await;
            if loop_rank(level) > loop_rank(worst) {
                worst = level;
            }
            outputs[i] = Some(output);
        }

        DispatchOutcome {
            outputs: outputs.into_iter().map(|o| o.expect("all slots filled")).collect(),
            worst_loop_level: worst,
        }
    }

    async fn execute_canonical(
        &self,
        call: &ToolCall,
        signature: &str,
        ctx: &TurnCtx,
    ) -> (ToolOutput, LoopLevel) {
        let Some(tool) = self.registry.get(&call.name) else {
            return (
                ToolOutput::err(
                    &call.id,
                    ToolError::new(
                        ErrorCode::NotFound,
                        format!("unknown tool: {}", call.name),
                    )
                    .with_hint("only the advertised tool set is available"),
                ),
                LoopLevel::None,
            );
        };

        if ctx.tool_ctx.cancel.is_cancelled() {
            return (
                ToolOutput::err(
                    &call.id,
                    ToolError::new(ErrorCode::Internal, "cancelled before execution"),
                ),
                LoopLevel::None,
            );
        }

        // 1. Validation: unknown keys stripped into issues, hard failures
        //    materialize as invalid_args.
        let validated = match tool.arg_spec().validate(&call.args) {
            Ok(v) => v,
            Err(e) => return (ToolOutput::err(&call.id, e), LoopLevel::None),
        };
        let mut issues = validated.issues;
        let mut args = validated.args;

        // 2. Path confinement for every file-operating tool.
        match self.confine_paths(&call.name, &mut args) {
            Ok(mut warnings) => issues.append(&mut warnings),
            Err(e) => return (ToolOutput::err(&call.id, e), LoopLevel::None),
        }

        // 3. Loop guard registration.
        let mutating = !tool.read_only();
        let verdict = self.guard.lock().unwrap().register_call(signature, mutating);
        match verdict.level {
            LoopLevel::Warning => issues.push(
                "loop warning: this call has been repeated several times; change parameters or stop repeating".into(),
            ),
            LoopLevel::Critical => issues.push(
                "loop critical: runaway repetition detected; tools will be disabled for the next turn".into(),
            ),
            LoopLevel::None => {}
        }

        // 4. Safety gate for side-effecting calls; approvals honor the
        //    cancellation token while waiting.
        if call.name == "exec" {
            let command = args.get("command").and_then(Value::as_str).unwrap_or("");
            let gate = tokio::select! {
                biased;
                _ = ctx.tool_ctx.cancel.cancelled() => Err(ToolError::new(
                    ErrorCode::Internal,
                    "cancelled while awaiting approval",
                )),
                r = self.safety.gate_exec(&call.id, command) => r,
            };
            match gate {
                Ok(cleared) => {
                    if let Some(w) = cleared.warning {
                        issues.push(w);
                    }
                }
                Err(e) => return (ToolOutput::err(&call.id, e), verdict.level),
            }
        } else if mutating && !tool.mutated_paths(&args).is_empty() {
            let summary = edit_summary(&call.name, &args);
            let gate = tokio::select! {
                biased;
                _ = ctx.tool_ctx.cancel.cancelled() => Err(ToolError::new(
                    ErrorCode::Internal,
                    "cancelled while awaiting approval",
                )),
                r = self.safety.gate_edit(&call.name, &args, &summary) => r,
            };
            if let Err(e) = gate {
                return (ToolOutput::err(&call.id, e), verdict.level);
            }
        }

        // 5. Read cache replay for cacheable tools.
        let path_key = read_path_key(&call.name, &args);
        if tool.cacheable() {
            let hit = self.guard.lock().unwrap().read_cache_replay(
                &call.name,
                signature,
                path_key.as_deref(),
            );
            if let Some(hit) = hit {
                let mut guard = self.guard.lock().unwrap();
                guard.register_outcome(signature, &fingerprint(&hit.text), false);
                return (
                    finish_output(ToolOutput::ok(&call.id, hit.text), &issues),
                    verdict.level,
                );
            }
        }

        // 6. Mutations: invalidate caches and capture checkpoints first.
        // Patch file lists are workdir-relative; anchor them.
        let mutated: Vec<PathBuf> = tool
            .mutated_paths(&args)
            .into_iter()
            .map(PathBuf::from)
            .map(|p| {
                if p.is_absolute() {
                    p
                } else {
                    ctx.tool_ctx.workdir.join(p)
                }
            })
            .collect();
        let mut checkpoints = Vec::new();
        if !mutated.is_empty() {
            let mut guard = self.guard.lock().unwrap();
            for p in &mutated {
                guard.invalidate_file_content_cache(p);
            }
            drop(guard);
            if let (Some(replay), Some(op)) = (&self.replay, mutation_op(&call.name)) {
                let mut replay = replay.lock().unwrap();
                for p in &mutated {
                    match replay.begin(op, p, None) {
                        Ok(id) => checkpoints.push(id),
                        Err(e) => warn!(path = %p.display(), "checkpoint capture failed: {e}"),
                    }
                }
            }
        }

        // 7. Execute.
        let effective = ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            args,
        };
        let output = tool.execute(&effective, &ctx.tool_ctx).await;

        if let Some(replay) = &self.replay {
            let mut replay = replay.lock().unwrap();
            for id in checkpoints {
                if let Err(e) = replay.complete(id) {
                    warn!("checkpoint completion failed: {e}");
                }
            }
        }

        // 8. Guard bookkeeping: cache successful reads, record the outcome.
        {
            let mut guard = self.guard.lock().unwrap();
            if tool.cacheable() && !output.is_error() {
                let path = effective
                    .args
                    .get("path")
                    .and_then(Value::as_str)
                    .map(PathBuf::from);
                guard.store_read_cache(
                    &call.name,
                    signature,
                    path.as_deref(),
                    path_key,
                    &output.content,
                );
            }
            guard.register_outcome(signature, &fingerprint(&output.content), output.is_error());
        }

        (finish_output(output, &issues), verdict.level)
    }

    /// Resolve and confine every path argument of this call, rewriting the
    /// arguments to the resolved form.  Returns accumulated warnings.
    fn confine_paths(&self, tool: &str, args: &mut Value) -> Result<Vec<String>, ToolError> {
        let mut warnings = Vec::new();

        let mut confine_one = |v: &mut Value| -> Result<(), ToolError> {
            if let Some(raw) = v.as_str() {
                let (resolved, cleared) = self.safety.resolve_path(raw)?;
                *v = Value::String(resolved.to_string_lossy().into_owned());
                if let Some(w) = cleared.warning {
                    warnings.push(w);
                }
            }
            Ok(())
        };

        if let Some(path) = args.get_mut("path") {
            confine_one(path)?;
        }
        if tool == "read_many" {
            if let Some(requests) = args.get_mut("requests").and_then(Value::as_array_mut) {
                for req in requests {
                    if let Some(path) = req.get_mut("path") {
                        confine_one(path)?;
                    }
                }
            }
        }
        if tool == "apply_patch" {
            // Confinement check only; the tool itself applies relative to
            // the working root and rejects `..` / absolute patch paths.
            if let Some(files) = args.get("files").and_then(Value::as_array) {
                for f in files.iter().filter_map(Value::as_str) {
                    let (_, cleared) = self.safety.resolve_path(f)?;
                    if let Some(w) = cleared.warning {
                        warnings.push(w);
                    }
                }
            }
        }
        Ok(warnings)
    }
}

/// Duplicate call ids are tolerated and normalized with a suffix.
fn normalize_call_ids(calls: &[ToolCall]) -> Vec<ToolCall> {
    let mut seen: HashMap<String, u32> = HashMap::new();
    calls
        .iter()
        .map(|c| {
            let n = seen.entry(c.id.clone()).or_insert(0);
            let mut call = c.clone();
            if *n > 0 {
                call.id = format!("{}_dup{}", c.id, n);
            }
            *n += 1;
            call
        })
        .collect()
}

/// Append validation issues and gate warnings to a tool result.
fn finish_output(mut output: ToolOutput, issues: &[String]) -> ToolOutput {
    if !issues.is_empty() {
        let block: String = issues
            .iter()
            .map(|i| format!("\n[{i}]"))
            .collect();
        output.content.push_str(&block);
    }
    output
}

/// Path-layer cache key `(abs_path | offset | limit)` for single reads.
fn read_path_key(tool: &str, args: &Value) -> Option<String> {
    if tool != "read_file" {
        return None;
    }
    let path = args.get("path")?.as_str()?;
    let offset = args.get("offset").and_then(Value::as_i64).unwrap_or(1);
    let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(200);
    Some(format!("{path}|{offset}|{limit}"))
}

fn mutation_op(tool: &str) -> Option<MutationOp> {
    match tool {
        "write_file" => Some(MutationOp::Write),
        "edit_text" => Some(MutationOp::EditText),
        "edit_range" => Some(MutationOp::EditRange),
        "insert_file" => Some(MutationOp::Insert),
        "apply_patch" => Some(MutationOp::Patch),
        _ => None,
    }
}

fn edit_summary(tool: &str, args: &Value) -> String {
    let path = args.get("path").and_then(Value::as_str).unwrap_or("?");
    format!("{tool} {path}")
}

fn fingerprint(content: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn loop_rank(level: LoopLevel) -> u8 {
    match level {
        LoopLevel::None => 0,
        LoopLevel::Warning => 1,
        LoopLevel::Critical => 2,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::safety::AutoApprove;
    use crate::tool::{StdStream, Tool, ToolCtx};
    use crate::validate::ArgSpec;
    use tiller_config::{GuardConfig, SafetyConfig};

    struct CountingRead {
        executions: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Tool for CountingRead {
        fn name(&self) -> &str {
            "fake_read"
        }
        fn description(&self) -> &str {
            "counting read"
        }
        fn arg_spec(&self) -> ArgSpec {
            ArgSpec::new().string("key", true, "lookup key")
        }
        fn read_only(&self) -> bool {
            true
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
            self.executions.fetch_add(1, Ordering::SeqCst);
            ToolOutput::ok(&call.id, format!("value for {}", call.args["key"]))
        }
    }

    fn dispatcher_with(counter: Arc<AtomicU32>, workdir: &std::path::Path) -> Dispatcher {
        let mut reg = ToolRegistry::new();
        reg.register(CountingRead {
            executions: counter,
        });
        let safety = Arc::new(SafetyGate::new(
            &SafetyConfig::default(),
            workdir.to_path_buf(),
            Box::new(AutoApprove),
        ));
        Dispatcher::new(
            Arc::new(reg),
            ToolLoopGuard::new(&GuardConfig::default()),
            safety,
            None,
        )
    }

    fn ctx(workdir: &std::path::Path) -> TurnCtx {
        TurnCtx {
            turn_index: 0,
            tool_ctx: ToolCtx::new(workdir.to_path_buf()),
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    // Scenario: dedup within a turn — three calls, two distinct signatures,
    // exactly two handler invocations, replay byte-identical to canonical.
    #[tokio::test]
    async fn dedup_within_turn_replays_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        let d = dispatcher_with(Arc::clone(&counter), dir.path());

        let calls = vec![
            call("c1", "fake_read", json!({"key": "a"})),
            call("c2", "fake_read", json!({"key": "a"})),
            call("c3", "fake_read", json!({"key": "b"})),
        ];
        let outcome = d.dispatch_turn(&calls, &ctx(dir.path())).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2, "exactly two executions");
        assert_eq!(outcome.outputs.len(), 3);
        assert_eq!(outcome.outputs[0].content, outcome.outputs[1].content);
        assert_eq!(outcome.outputs[1].call_id, "c2");
        assert_ne!(outcome.outputs[2].content, outcome.outputs[0].content);
    }

    #[tokio::test]
    async fn outputs_preserve_original_order() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        let d = dispatcher_with(Arc::clone(&counter), dir.path());

        let calls = vec![
            call("c1", "fake_read", json!({"key": "x"})),
            call("c2", "fake_read", json!({"key": "y"})),
            call("c3", "fake_read", json!({"key": "x"})),
        ];
        let outcome = d.dispatch_turn(&calls, &ctx(dir.path())).await;
        assert_eq!(outcome.outputs[0].call_id, "c1");
        assert_eq!(outcome.outputs[1].call_id, "c2");
        assert_eq!(outcome.outputs[2].call_id, "c3");
        assert_eq!(outcome.outputs[2].content, outcome.outputs[0].content);
    }

    #[tokio::test]
    async fn unknown_tool_materializes_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher_with(Arc::new(AtomicU32::new(0)), dir.path());
        let outcome = d
            .dispatch_turn(&[call("c1", "bogus", json!({}))], &ctx(dir.path()))
            .await;
        let out = &outcome.outputs[0];
        assert!(out.is_error());
        assert_eq!(out.error.as_ref().unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn invalid_args_materialized_not_thrown() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher_with(Arc::new(AtomicU32::new(0)), dir.path());
        let outcome = d
            .dispatch_turn(&[call("c1", "fake_read", json!({}))], &ctx(dir.path()))
            .await;
        let out = &outcome.outputs[0];
        assert_eq!(out.error.as_ref().unwrap().code, ErrorCode::InvalidArgs);
    }

    #[tokio::test]
    async fn unknown_keys_reported_as_issue_in_result() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher_with(Arc::new(AtomicU32::new(0)), dir.path());
        let outcome = d
            .dispatch_turn(
                &[call("c1", "fake_read", json!({"key": "a", "bogus": 1}))],
                &ctx(dir.path()),
            )
            .await;
        let out = &outcome.outputs[0];
        assert!(!out.is_error());
        assert!(out.content.contains("unknown key 'bogus'"));
    }

    #[tokio::test]
    async fn duplicate_call_ids_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher_with(Arc::new(AtomicU32::new(0)), dir.path());
        let calls = vec![
            call("same", "fake_read", json!({"key": "a"})),
            call("same", "fake_read", json!({"key": "b"})),
        ];
        let outcome = d.dispatch_turn(&calls, &ctx(dir.path())).await;
        assert_eq!(outcome.outputs[0].call_id, "same");
        assert_eq!(outcome.outputs[1].call_id, "same_dup1");
    }

    #[tokio::test]
    async fn cancelled_context_skips_execution() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        let d = dispatcher_with(Arc::clone(&counter), dir.path());
        let ctx = ctx(dir.path());
        ctx.tool_ctx.cancel.cancel();
        let outcome = d
            .dispatch_turn(&[call("c1", "fake_read", json!({"key": "a"}))], &ctx)
            .await;
        assert!(outcome.outputs[0].is_error());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loop_warning_appended_after_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher_with(Arc::new(AtomicU32::new(0)), dir.path());
        // Same signature across turns: dedup only applies within one turn,
        // so four single-call turns drive the per-signature counter to 4.
        for _ in 0..3 {
            let _ = d
                .dispatch_turn(&[call("c", "fake_read", json!({"key": "a"}))], &ctx(dir.path()))
                .await;
        }
        let outcome = d
            .dispatch_turn(&[call("c", "fake_read", json!({"key": "a"}))], &ctx(dir.path()))
            .await;
        assert_eq!(outcome.worst_loop_level, LoopLevel::Warning);
    }

    #[tokio::test]
    async fn stream_chunk_type_is_exported() {
        // Compile-time shape check for the tool_stream callback surface.
        let chunk = crate::tool::ToolStreamChunk {
            call_id: "c".into(),
            stream: StdStream::Stdout,
            chunk: "x".into(),
        };
        assert_eq!(chunk.stream, StdStream::Stdout);
    }
}
