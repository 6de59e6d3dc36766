// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn orchestrator.  Owns the transcript and drives the
//! ask → respond cycle: compaction, lane routing, streaming with provider
//! fallback, tool dispatch, watchdog supervision and cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tiller_config::{Config, Lane};
use tiller_model::{
    CompletionRequest, Message, ModelError, ModelProvider, ResponseEvent, ToolSchema, Usage,
};
use tiller_tools::{recover_tool_calls, CancelToken, Dispatcher, ToolCall, ToolCtx, TurnCtx};

use crate::{
    compact::compact,
    events::AgentEvent,
    hooks::{HookBus, HookContext, HookEvent, HookPayload},
    router::{Decision, TurnRouter},
    session::MessageStore,
};

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a coding agent operating on a local workspace through tools. \
Work step by step: inspect before you modify, prefer small verifiable \
changes, and report what you did. Use the vault to record decisions and \
findings that must survive context compaction. When you are done, answer \
in plain text without calling further tools.";

/// The result of one successful ask.
#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub final_text: String,
    pub tool_call_count: u32,
    pub usage: Usage,
}

/// Terminal ask failures.  `Cancelled` is distinguished so callers can
/// suppress error banners.
#[derive(Debug, thiserror::Error)]
pub enum AskError {
    #[error("cancelled")]
    Cancelled,
    #[error("maximum iterations ({0}) reached")]
    MaxIterations(u32),
    #[error("response timeout")]
    ResponseTimeout,
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("fatal tool failure: {0}")]
    ToolFatal(String),
}

impl AskError {
    /// Short kind name for banners and hook payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AskError::Cancelled => "cancelled",
            AskError::MaxIterations(_) => "max_iterations",
            AskError::ResponseTimeout => "response_timeout",
            AskError::Model(_) => "model_error",
            AskError::ToolFatal(_) => "tool_fatal",
        }
    }
}

/// Named model providers resolvable from router targets.
#[derive(Clone, Default)]
pub struct ProviderSet {
    map: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        self.map.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelProvider>> {
        self.map.get(name).cloned()
    }
}

/// Per-turn state machine, surfaced for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Thinking,
    Responding,
    Tool,
}

struct TurnOutput {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
}

enum TurnFailure {
    Model(ModelError),
    /// Watchdog declared the stream stuck.
    Stalled,
    Cancelled,
}

pub struct Agent {
    store: MessageStore,
    dispatcher: Arc<Dispatcher>,
    providers: ProviderSet,
    router: TurnRouter,
    config: Arc<Config>,
    hooks: Arc<HookBus>,
    session_id: String,
    workdir: PathBuf,
    system_prompt: String,
    requested_lane: Option<Lane>,
    /// Optional output-token budget (subtasks); exceeding it ends the ask
    /// gracefully after the current turn.
    token_budget: Option<u64>,
    /// Model/endpoint of the most recent target, for hook payloads.
    current_model: String,
    current_endpoint: String,
}

impl Agent {
    pub fn new(
        config: Arc<Config>,
        providers: ProviderSet,
        dispatcher: Arc<Dispatcher>,
        hooks: Arc<HookBus>,
        workdir: PathBuf,
    ) -> Self {
        let router = TurnRouter::new(config.router.clone(), config.providers.clone());
        Self {
            store: MessageStore::new(),
            dispatcher,
            providers,
            router,
            config,
            hooks,
            session_id: uuid::Uuid::new_v4().to_string(),
            workdir,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            requested_lane: None,
            token_budget: None,
            current_model: String::new(),
            current_endpoint: String::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Adopt an externally created session id so the vault, replay store
    /// and capture files all share it.
    pub fn set_session_id(&mut self, id: impl Into<String>) {
        self.session_id = id.into();
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Caller-requested lane override (`fast`/`heavy` mode); bypasses the
    /// classifier and hysteresis.
    pub fn set_requested_lane(&mut self, lane: Option<Lane>) {
        self.requested_lane = lane;
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn set_token_budget(&mut self, budget: Option<u64>) {
        self.token_budget = budget;
    }

    /// Reset the transcript and router state for a fresh session.
    pub fn reset(&mut self) {
        self.store = MessageStore::new();
        self.router.reset();
        self.session_id = uuid::Uuid::new_v4().to_string();
    }

    pub async fn ask(
        &mut self,
        instruction: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> Result<AskOutcome, AskError> {
        self.ask_with_cancel(instruction, tx, CancelToken::new())
            .await
    }

    /// Like [`ask`], with attachment blocks appended to the user turn.
    ///
    /// [`ask`]: Self::ask
    pub async fn ask_with_attachments(
        &mut self,
        instruction: &str,
        attachments: &[String],
        tx: mpsc::Sender<AgentEvent>,
    ) -> Result<AskOutcome, AskError> {
        let combined = if attachments.is_empty() {
            instruction.to_string()
        } else {
            let blocks: Vec<String> = attachments
                .iter()
                .enumerate()
                .map(|(i, a)| format!("--- attachment {} ---\n{a}", i + 1))
                .collect();
            format!("{instruction}\n\n{}", blocks.join("\n\n"))
        };
        self.ask_with_cancel(&combined, tx, CancelToken::new()).await
    }

    /// Run one ask to completion.  The cancellation token is observed
    /// between suspension points: already-appended tool messages are kept,
    /// but no new model turn starts after cancellation.
    pub async fn ask_with_cancel(
        &mut self,
        instruction: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancelToken,
    ) -> Result<AskOutcome, AskError> {
        if cancel.is_cancelled() {
            let _ = tx
                .send(AgentEvent::Aborted {
                    partial_text: String::new(),
                })
                .await;
            return Err(AskError::Cancelled);
        }

        self.emit_hook(HookPayload::AskStart {
            instruction: instruction.to_string(),
        })?;

        if self.store.is_empty() {
            self.store.append(Message::system(&self.system_prompt));
        }
        self.store.append(Message::user(instruction));

        let result = self.run_loop(instruction, &tx, &cancel).await;

        let outcome_name = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.kind().to_string(),
        };
        // AskEnd is informational; a strict-hook failure here cannot
        // retroactively change a finished ask.
        let _ = self.emit_hook(HookPayload::AskEnd {
            outcome: outcome_name,
        });
        result
    }

    async fn run_loop(
        &mut self,
        instruction: &str,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancelToken,
    ) -> Result<AskOutcome, AskError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.agent.ask_timeout_secs);
        let mut iteration: u32 = 0;
        let mut tool_call_count: u32 = 0;
        let mut usage = Usage::default();
        let mut with_tools = true;
        let mut watchdog_compactions: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                let _ = tx
                    .send(AgentEvent::Aborted {
                        partial_text: String::new(),
                    })
                    .await;
                return Err(AskError::Cancelled);
            }

            self.maybe_compact(tx, iteration).await;

            let decision = self.router.decide(instruction, self.requested_lane);
            let _ = tx
                .send(AgentEvent::LaneSelected {
                    lane: decision.lane,
                    source: decision.source,
                })
                .await;
            self.emit_hook(HookPayload::Info {
                kind: "routing".into(),
                message: format!("lane {} via {:?}", decision.lane, decision.source),
            })?;
            self.emit_hook(HookPayload::TurnStart { turn: iteration })?;

            let output = match self
                .run_turn_with_fallback(
                    &decision,
                    with_tools,
                    tx,
                    cancel,
                    &mut watchdog_compactions,
                    iteration,
                )
                .await
            {
                Ok(o) => o,
                Err(TurnFailure::Cancelled) => {
                    let _ = tx
                        .send(AgentEvent::Aborted {
                            partial_text: String::new(),
                        })
                        .await;
                    return Err(AskError::Cancelled);
                }
                Err(TurnFailure::Stalled) => return Err(AskError::ResponseTimeout),
                Err(TurnFailure::Model(e)) if e.is_timeout() => {
                    return Err(AskError::ResponseTimeout)
                }
                Err(TurnFailure::Model(e)) => return Err(AskError::Model(e)),
            };

            usage.add(output.usage.input_tokens, output.usage.output_tokens);
            let _ = tx
                .send(AgentEvent::TokenUsage {
                    input: output.usage.input_tokens,
                    output: output.usage.output_tokens,
                })
                .await;

            // Argument-parsing fallback: a tool-call-free response whose
            // content carries structured material is recovered into calls.
            let mut tool_calls = output.tool_calls;
            let mut recovered_from_text = false;
            if tool_calls.is_empty() && !output.text.is_empty() {
                let recovered = recover_tool_calls(&output.text);
                if !recovered.is_empty() {
                    debug!(count = recovered.len(), "recovered tool calls from text");
                    tool_calls = recovered;
                    recovered_from_text = true;
                }
            }

            if tool_calls.is_empty() {
                self.store.append(Message::assistant(&output.text));
                self.emit_hook(HookPayload::TurnEnd { turn: iteration })?;
                let _ = tx.send(AgentEvent::TextComplete(output.text.clone())).await;
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(AskOutcome {
                    final_text: output.text,
                    tool_call_count,
                    usage,
                });
            }

            // Transcript: optional assistant prose, then one assistant
            // tool-call message per call (the recovered-from-text form
            // replaces the prose — the prose *was* the calls).
            if !output.text.is_empty() && !recovered_from_text {
                self.store.append(Message::assistant(&output.text));
            }
            for tc in &tool_calls {
                self.store
                    .append(Message::tool_call(&tc.id, &tc.name, tc.args.to_string()));
                let _ = tx.send(AgentEvent::ToolCallStarted(tc.clone())).await;
                self.emit_hook(HookPayload::ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    args: tc.args.clone(),
                })?;
            }
            tool_call_count += tool_calls.len() as u32;

            self.state_note(TurnState::Tool, iteration);
            let outputs = self
                .dispatch_tools(&tool_calls, iteration, tx, cancel)
                .await;
            for out in &outputs {
                self.store.append(Message::tool_result(&out.call_id, &out.content));
                // Replays of duplicate ids carry a `_dupN` suffix.
                let name = tool_calls
                    .iter()
                    .find(|tc| {
                        out.call_id == tc.id
                            || out
                                .call_id
                                .strip_prefix(&tc.id)
                                .is_some_and(|rest| rest.starts_with("_dup"))
                    })
                    .map(|tc| tc.name.clone())
                    .unwrap_or_default();
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        call_id: out.call_id.clone(),
                        tool_name: name.clone(),
                        output: out.content.clone(),
                        is_error: out.is_error(),
                        error_code: out.error.as_ref().map(|e| e.code.to_string()),
                    })
                    .await;
                self.emit_hook(HookPayload::ToolResult {
                    id: out.call_id.clone(),
                    name,
                    success: !out.is_error(),
                    summary: summarize(&out.content),
                })?;
            }

            // A critical loop verdict disables tools for the next turn only.
            with_tools = !self.dispatcher.should_disable_tools_next_turn();

            self.emit_hook(HookPayload::TurnEnd { turn: iteration })?;

            // Cancellation after dispatch: the tool messages above stay in
            // the transcript, but no new model turn starts.
            if cancel.is_cancelled() {
                let _ = tx
                    .send(AgentEvent::Aborted {
                        partial_text: String::new(),
                    })
                    .await;
                return Err(AskError::Cancelled);
            }

            if let Some(budget) = self.token_budget {
                let spent = usage.input_tokens as u64 + usage.output_tokens as u64;
                if spent >= budget {
                    let note = "(token budget exhausted before a final answer)";
                    self.store.append(Message::assistant(note));
                    let _ = tx.send(AgentEvent::TurnComplete).await;
                    return Ok(AskOutcome {
                        final_text: note.to_string(),
                        tool_call_count,
                        usage,
                    });
                }
            }

            iteration += 1;
            if iteration >= self.config.agent.max_iterations {
                return Err(AskError::MaxIterations(self.config.agent.max_iterations));
            }
            if Instant::now() >= deadline {
                return Err(AskError::ResponseTimeout);
            }
        }
    }

    /// Dispatch one turn's calls, forwarding live tool output as events.
    async fn dispatch_tools(
        &self,
        tool_calls: &[ToolCall],
        iteration: u32,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancelToken,
    ) -> Vec<tiller_tools::ToolOutput> {
        let (stream_tx, mut stream_rx) = mpsc::channel::<tiller_tools::ToolStreamChunk>(64);
        let forward_tx = tx.clone();
        let hooks = Arc::clone(&self.hooks);
        let context = self.hook_context();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = stream_rx.recv().await {
                let stream_name = match chunk.stream {
                    tiller_tools::StdStream::Stdout => "stdout",
                    tiller_tools::StdStream::Stderr => "stderr",
                };
                // Live chunks are observational; hook errors here never
                // fail the ask.
                let _ = hooks.emit(&HookEvent {
                    context: context.clone(),
                    payload: HookPayload::ToolStream {
                        id: chunk.call_id.clone(),
                        stream: stream_name.into(),
                        chunk: chunk.chunk.clone(),
                    },
                });
                let _ = forward_tx
                    .send(AgentEvent::ToolStream {
                        call_id: chunk.call_id,
                        stream: chunk.stream,
                        chunk: chunk.chunk,
                    })
                    .await;
            }
        });

        let turn_ctx = TurnCtx {
            turn_index: iteration,
            tool_ctx: ToolCtx {
                cancel: cancel.clone(),
                stream: Some(stream_tx),
                workdir: self.workdir.clone(),
            },
        };
        let outcome = self.dispatcher.dispatch_turn(tool_calls, &turn_ctx).await;
        drop(turn_ctx);
        let _ = forwarder.await;
        outcome.outputs
    }

    /// Try the turn against each provider target in order.  Transient
    /// failures move to the next target without advancing the iteration
    /// counter; a watchdog stall earns one compaction retry per ask budget.
    async fn run_turn_with_fallback(
        &mut self,
        decision: &Decision,
        with_tools: bool,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancelToken,
        watchdog_compactions: &mut u32,
        iteration: u32,
    ) -> Result<TurnOutput, TurnFailure> {
        let targets = &decision.targets;
        if targets.is_empty() {
            return Err(TurnFailure::Model(ModelError::Fatal(
                "no provider targets configured for this lane".into(),
            )));
        }

        let mut last_err: Option<ModelError> = None;
        for (i, target) in targets.iter().enumerate() {
            let Some(provider) = self.providers.get(&target.provider) else {
                warn!(provider = %target.provider, "configured provider not registered");
                continue;
            };
            self.current_model = target.model.clone();
            self.current_endpoint = provider.endpoint().to_string();

            loop {
                match self
                    .stream_one_turn(&provider, &target.model, with_tools, tx, cancel)
                    .await
                {
                    Ok(output) => return Ok(output),
                    Err(TurnFailure::Stalled) => {
                        if *watchdog_compactions < self.config.agent.watchdog_max_compactions {
                            *watchdog_compactions += 1;
                            warn!("watchdog stall; compacting and retrying the turn");
                            self.force_compact(tx, iteration).await;
                            continue;
                        }
                        return Err(TurnFailure::Stalled);
                    }
                    Err(TurnFailure::Cancelled) => return Err(TurnFailure::Cancelled),
                    Err(TurnFailure::Model(e))
                        if e.is_transient() && i + 1 < targets.len() =>
                    {
                        let next = &targets[i + 1].provider;
                        warn!(
                            from = %target.provider,
                            to = %next,
                            "transient model error; switching provider: {e}"
                        );
                        let _ = tx
                            .send(AgentEvent::ProviderSwitch {
                                from: target.provider.clone(),
                                to: next.clone(),
                            })
                            .await;
                        let _ = self.emit_hook(HookPayload::Info {
                            kind: "provider_switch".into(),
                            message: format!("{} -> {next}", target.provider),
                        });
                        last_err = Some(e);
                        break;
                    }
                    Err(f) => return Err(f),
                }
            }
        }
        Err(TurnFailure::Model(last_err.unwrap_or_else(|| {
            ModelError::Fatal("no usable provider target".into())
        })))
    }

    /// Stream one model turn, supervised by the watchdog.
    async fn stream_one_turn(
        &mut self,
        provider: &Arc<dyn ModelProvider>,
        model: &str,
        with_tools: bool,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancelToken,
    ) -> Result<TurnOutput, TurnFailure> {
        let tools: Vec<ToolSchema> = if with_tools {
            self.dispatcher
                .registry()
                .schemas()
                .into_iter()
                .map(|s| ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect()
        } else {
            Vec::new()
        };

        let req = CompletionRequest {
            messages: self.store.snapshot(),
            tools,
            stream: true,
            model: Some(model.to_string()),
            max_tokens: None,
            temperature: None,
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnFailure::Cancelled),
            r = provider.complete(req) => r.map_err(TurnFailure::Model)?,
        };

        let mut state = TurnState::Thinking;
        let mut text = String::new();
        let mut usage = Usage::default();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let watchdog = Duration::from_millis(self.config.agent.watchdog_timeout_ms);
        let mut grace_remaining = self.config.agent.idle_grace_timeouts;
        let mut last_event = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnFailure::Cancelled),
                ev = stream.next() => {
                    last_event = Instant::now();
                    grace_remaining = self.config.agent.idle_grace_timeouts;
                    match ev {
                        None => break,
                        Some(Err(e)) => return Err(TurnFailure::Model(e)),
                        Some(Ok(ResponseEvent::TextDelta(delta))) => {
                            if state == TurnState::Thinking {
                                state = TurnState::Responding;
                                self.state_note(state, 0);
                            }
                            text.push_str(&delta);
                            let _ = tx.send(AgentEvent::TextDelta(delta)).await;
                        }
                        Some(Ok(ResponseEvent::ToolCall { index, id, name, arguments })) => {
                            if state == TurnState::Thinking {
                                state = TurnState::Tool;
                                self.state_note(state, 0);
                            }
                            let ptc = pending.entry(index).or_default();
                            if !id.is_empty() {
                                ptc.id = id;
                            }
                            if !name.is_empty() {
                                ptc.name = name;
                            }
                            ptc.args_buf.push_str(&arguments);
                        }
                        Some(Ok(ResponseEvent::Usage { input_tokens, output_tokens })) => {
                            usage = Usage { input_tokens, output_tokens };
                        }
                        Some(Ok(ResponseEvent::Warning(msg))) => {
                            let _ = tx.send(AgentEvent::Warning(msg)).await;
                        }
                        Some(Ok(ResponseEvent::Done)) => break,
                    }
                }
                _ = tokio::time::sleep_until((last_event + watchdog).into()) => {
                    if grace_remaining > 0 {
                        // Silent but not yet stuck: consume one grace
                        // interval before acting.
                        grace_remaining -= 1;
                        last_event = Instant::now();
                        debug!(grace_remaining, "watchdog grace interval consumed");
                        continue;
                    }
                    warn!("watchdog: no stream activity within {watchdog:?}");
                    return Err(TurnFailure::Stalled);
                }
            }
        }

        // Flush accumulated parallel tool calls ordered by index.  Calls
        // with an empty name cannot be dispatched and are dropped; an
        // empty id gets a synthetic fallback so the turn still completes.
        let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        sorted.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::new();
        for (i, (_, ptc)) in sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(call_id = %ptc.id, "dropping tool call with empty name");
                continue;
            }
            let mut tc = ptc.finish();
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
            }
            tool_calls.push(tc);
        }

        Ok(TurnOutput {
            text,
            tool_calls,
            usage,
        })
    }

    /// Explicit user-requested compaction.
    pub async fn compact_now(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        self.force_compact(tx, 0).await;
    }

    /// Compact when the estimate crosses the configured fraction of the
    /// context window.
    async fn maybe_compact(&mut self, tx: &mpsc::Sender<AgentEvent>, iteration: u32) {
        let window = self.config.agent.context_window;
        let threshold = (window as f32 * self.config.agent.compact_at) as usize;
        if self.store.estimate_tokens() < threshold {
            return;
        }
        self.force_compact(tx, iteration).await;
    }

    async fn force_compact(&mut self, tx: &mpsc::Sender<AgentEvent>, iteration: u32) {
        let window = self.config.agent.context_window;
        let target = (window as f32 * self.config.agent.compact_target) as usize;
        let report = compact(&mut self.store, target, window);
        if report.freed == 0 {
            return;
        }
        debug!(
            before = report.before,
            after = report.after,
            freed = report.freed,
            "context compacted"
        );
        let _ = tx
            .send(AgentEvent::ContextCompacted {
                before: report.before,
                after: report.after,
                freed: report.freed,
                turn: iteration,
            })
            .await;
        let _ = self.emit_hook(HookPayload::Info {
            kind: "compaction".into(),
            message: format!("freed {} tokens", report.freed),
        });
    }

    fn hook_context(&self) -> HookContext {
        HookContext {
            session_id: self.session_id.clone(),
            cwd: self.workdir.to_string_lossy().into_owned(),
            model: self.current_model.clone(),
            endpoint: self.current_endpoint.clone(),
            harness: "cli".into(),
        }
    }

    fn emit_hook(&self, payload: HookPayload) -> Result<(), AskError> {
        self.hooks
            .emit(&HookEvent {
                context: self.hook_context(),
                payload,
            })
            .map_err(|e| AskError::ToolFatal(format!("strict hook failure: {e}")))
    }

    fn state_note(&self, state: TurnState, turn: u32) {
        debug!(?state, turn, "turn state");
    }
}

/// Short single-line summary of a tool result for hook payloads.
fn summarize(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default();
    let mut s: String = line.chars().take(120).collect();
    if s.len() < line.len() || content.lines().count() > 1 {
        s.push('…');
    }
    s
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Always resolve to a JSON object — tool arguments must be an object
    /// even when the model sent nothing or sent garbage.
    fn finish(self) -> ToolCall {
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %self.name,
                        error = %e,
                        "invalid JSON tool arguments; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            args,
        }
    }
}
