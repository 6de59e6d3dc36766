// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tiller_model::{Message, MessageContent, Role};

/// The ordered conversation transcript for one session.
///
/// The orchestrator is the sole mutator during a turn.  Invariants:
/// the first message is the system message and is never evicted; every
/// tool message references a preceding assistant tool-call; tool messages
/// never appear without their assistant parent.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// An owned copy of the transcript for building a model request.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Deterministic token estimate over the whole transcript, using the
    /// same per-message formula as the request builder.
    pub fn estimate_tokens(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }

    pub(crate) fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Transcript well-formedness: system message first, every tool
    /// message preceded by an assistant tool-call carrying its id.
    pub fn is_well_formed(&self) -> bool {
        if self.messages.is_empty() {
            return true;
        }
        if self.messages[0].role != Role::System {
            return false;
        }
        for (i, m) in self.messages.iter().enumerate() {
            if let MessageContent::ToolResult { tool_call_id, .. } = &m.content {
                let has_parent = self.messages[..i].iter().any(|prev| {
                    prev.role == Role::Assistant
                        && matches!(
                            &prev.content,
                            MessageContent::ToolCall { tool_call_id: id, .. } if id == tool_call_id
                        )
                });
                if !has_parent {
                    return false;
                }
            }
        }
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
