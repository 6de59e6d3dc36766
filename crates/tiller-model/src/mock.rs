// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::ResponseStream, CompletionRequest, ModelError, ResponseEvent};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<Result<ResponseEvent, ModelError>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted `complete()` outcome.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// The call succeeds and the stream emits these events.
    Events(Vec<ResponseEvent>),
    /// The call fails before any event is produced.
    Fail(ModelError),
}

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// script step from the front of the queue, so tests can specify exact
/// event sequences — including tool calls and transport failures — without
/// network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<ScriptStep>>>,
    name: String,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `complete()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Number of `complete()` calls made against this provider.
    pub calls: Arc<Mutex<u32>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<ScriptStep>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Build a provider from success-only event scripts.
    pub fn from_events(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self::new(scripts.into_iter().map(ScriptStep::Events).collect())
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::from_events(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
            ResponseEvent::Done,
        ]])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::from_events(vec![
            // Round 1 – model emits a tool call
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ],
            // Round 2 – model responds after the tool result
            vec![ResponseEvent::TextDelta(final_text.into()), ResponseEvent::Done],
        ])
    }

    /// Convenience: provider that fails with HTTP 503 `n` times, then
    /// answers with `reply`.
    pub fn unavailable_then_text(n: usize, reply: impl Into<String>) -> Self {
        let mut steps: Vec<ScriptStep> = (0..n)
            .map(|_| {
                ScriptStep::Fail(ModelError::Http {
                    status: 503,
                    body: "service unavailable".into(),
                })
            })
            .collect();
        let r = reply.into();
        steps.push(ScriptStep::Events(vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Done,
        ]));
        Self::new(steps)
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;
        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                ScriptStep::Events(vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done,
                ])
            } else {
                scripts.remove(0)
            }
        };
        match step {
            ScriptStep::Fail(e) => Err(e),
            ScriptStep::Events(events) => {
                let wrapped: Vec<Result<ResponseEvent, ModelError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
