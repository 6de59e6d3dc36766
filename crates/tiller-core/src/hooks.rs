// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The hook bus: lifecycle broadcast to observer plugins.
//!
//! Handlers are dispatched in registration order and receive payloads by
//! reference — they must not retain them past the callback.  Under
//! `strict` semantics a handler error fails the current ask; otherwise
//! errors are logged and swallowed.  Slow handlers emit a performance
//! warning.

use std::time::Instant;

use tracing::warn;

use tiller_config::HooksConfig;

/// Handler capabilities.  Only `Observe` is exercised by the engine; the
/// write-side names are parsed and reported but reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Observe,
    ReadPrompts,
    ReadToolArgs,
    ReadToolResults,
    /// Reserved; never enforced.
    ModifyPrompts,
}

/// Session-level fields present on every event.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub session_id: String,
    pub cwd: String,
    pub model: String,
    pub endpoint: String,
    /// Which front end drives the engine: `cli`, `bot`, `batch`.
    pub harness: String,
}

/// Event-specific payloads.
#[derive(Debug, Clone)]
pub enum HookPayload {
    SessionStart,
    AskStart {
        instruction: String,
    },
    TurnStart {
        turn: u32,
    },
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolStream {
        id: String,
        stream: String,
        chunk: String,
    },
    ToolResult {
        id: String,
        name: String,
        success: bool,
        summary: String,
    },
    TurnEnd {
        turn: u32,
    },
    AskEnd {
        outcome: String,
    },
    /// Cost and routing informational events.
    Info {
        kind: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct HookEvent {
    pub context: HookContext,
    pub payload: HookPayload,
}

pub trait HookHandler: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Observe]
    }

    /// Observe one event.  The reference is only valid for the duration of
    /// the call.
    fn on_event(&self, event: &HookEvent) -> anyhow::Result<()>;
}

pub struct HookBus {
    handlers: Vec<Box<dyn HookHandler>>,
    strict: bool,
    warn_ms: u64,
}

impl HookBus {
    pub fn new(config: &HooksConfig) -> Self {
        Self {
            handlers: Vec::new(),
            strict: config.strict,
            warn_ms: config.warn_ms,
        }
    }

    pub fn register(&mut self, handler: Box<dyn HookHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Broadcast one event to every handler in registration order.
    ///
    /// Returns `Err` only under strict semantics, in which case the caller
    /// fails the current ask.
    pub fn emit(&self, event: &HookEvent) -> anyhow::Result<()> {
        for handler in &self.handlers {
            let started = Instant::now();
            let result = handler.on_event(event);
            let elapsed = started.elapsed();
            if elapsed.as_millis() as u64 > self.warn_ms {
                warn!(
                    handler = handler.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow hook handler"
                );
            }
            if let Err(e) = result {
                if self.strict {
                    return Err(e.context(format!("hook handler '{}' failed", handler.name())));
                }
                warn!(handler = handler.name(), "hook handler error swallowed: {e}");
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
