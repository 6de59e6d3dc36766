// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tiller_config::Lane;
use tiller_tools::{StdStream, ToolCall};

use crate::router::DecisionSource;

/// Events emitted by the agent during one ask.
/// Consumers (CLI sink, presenter, tests) subscribe to these to drive
/// their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// The complete text response of one turn
    TextComplete(String),
    /// The model requested a tool call
    ToolCallStarted(ToolCall),
    /// Live stdout/stderr chunk from a running tool
    ToolStream {
        call_id: String,
        stream: StdStream,
        chunk: String,
    },
    /// A tool call finished (possibly served as a replay)
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
        /// Structured error kind when the call failed.
        error_code: Option<String>,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        before: usize,
        after: usize,
        freed: usize,
        turn: u32,
    },
    /// Usage totals from the latest completed model turn
    TokenUsage { input: u32, output: u32 },
    /// The router picked a lane for this turn
    LaneSelected {
        lane: Lane,
        source: DecisionSource,
    },
    /// A transient failure moved the turn to the next provider target
    ProviderSwitch { from: String, to: String },
    /// A recoverable warning (backpressure, hook slowness)
    Warning(String),
    /// The ask finished and the final answer is available
    TurnComplete,
    /// The ask was cancelled; any streamed text is carried along
    Aborted { partial_text: String },
}
