// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming chat client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! One [`ChatClient`] is constructed per provider target.  It owns:
//! - the HTTP transport with two independent clocks (connection timeout =
//!   time to first byte, response timeout = total),
//! - connection-phase retries with exponential backoff on transport failures
//!   and HTTP 503,
//! - a sliding-window 503 rate limiter that injects additional delay once a
//!   threshold is exceeded,
//! - a backpressure monitor that emits a warning event when the latest
//!   completion time exceeds `multiplier × rolling average`,
//! - optional request/response capture with header redaction.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use tiller_config::{ProviderConfig, StreamConfig};

use crate::{
    capture::{redact_headers, CaptureRecord, CaptureWriter},
    provider::ResponseStream,
    sanitize::sanitize_request,
    CompletionRequest, Message, MessageContent, ModelError, ResponseEvent, Role, Usage,
};

pub struct ChatClient {
    provider_name: String,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
    max_retries: u32,
    backoff_base: Duration,
    max_backoff: Duration,
    response_timeout: Duration,
    rate_limiter: Mutex<RateLimiter>,
    backpressure: Arc<Mutex<BackpressureMonitor>>,
    capture: Option<Arc<CaptureWriter>>,
}

impl ChatClient {
    pub fn from_config(
        provider_name: &str,
        provider: &ProviderConfig,
        stream: &StreamConfig,
        capture: Option<Arc<CaptureWriter>>,
    ) -> Self {
        let base = provider.base_url.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(stream.effective_connect_timeout_secs()))
            .timeout(Duration::from_secs(stream.response_timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            provider_name: provider_name.to_string(),
            model: provider.model.clone().unwrap_or_default(),
            api_key: provider.resolve_api_key(),
            chat_url: format!("{base}/chat/completions"),
            max_tokens: provider.max_tokens.unwrap_or(4096),
            temperature: provider.temperature.unwrap_or(0.2),
            extra_headers: provider.headers.clone(),
            client,
            max_retries: stream.max_retries,
            backoff_base: Duration::from_millis(stream.backoff_base_ms),
            max_backoff: Duration::from_millis(stream.max_backoff_ms),
            response_timeout: Duration::from_secs(stream.response_timeout_secs),
            rate_limiter: Mutex::new(RateLimiter::new(
                Duration::from_secs(stream.rate_limit_window_secs),
                stream.rate_limit_threshold,
                Duration::from_millis(stream.backoff_base_ms),
                Duration::from_millis(stream.max_backoff_ms),
            )),
            backpressure: Arc::new(Mutex::new(BackpressureMonitor::new(
                stream.backpressure_multiplier,
            ))),
            capture,
        }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let messages = build_wire_messages(&req.messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let model = req.model.clone().unwrap_or_else(|| self.model.clone());
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.temperature.unwrap_or(self.temperature),
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        sanitize_request(&mut body);
        body
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(key) = &self.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }
        headers.extend(self.extra_headers.iter().cloned());
        headers
    }

    /// Send the request, retrying connection-phase failures and HTTP 503
    /// with exponential backoff.  Any other outcome is final.
    async fn send_with_retry(&self, body: &Value) -> Result<reqwest::Response, ModelError> {
        let mut attempt: u32 = 0;
        loop {
            let mut req = self.client.post(&self.chat_url).json(body);
            for (name, val) in self.request_headers() {
                req = req.header(name.as_str(), val.as_str());
            }

            let outcome = match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    let err = ModelError::Http { status, body: text };
                    if status == 503 {
                        self.rate_limiter.lock().unwrap().record_503(Instant::now());
                    }
                    err
                }
                Err(e) if e.is_timeout() => {
                    return Err(ModelError::Timeout(self.response_timeout));
                }
                Err(e) => ModelError::Connect(e.to_string()),
            };

            if !outcome.is_transient() || attempt >= self.max_retries {
                return Err(outcome);
            }
            attempt += 1;

            let mut delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
            delay += self.rate_limiter.lock().unwrap().extra_delay(Instant::now());
            let delay = delay.min(self.max_backoff);
            warn!(
                provider = %self.provider_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %outcome,
                "transient completion failure; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

}

#[async_trait]
impl crate::ModelProvider for ChatClient {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> &str {
        &self.chat_url
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        let body = self.build_body(&req);
        debug!(
            provider = %self.provider_name,
            model = %body["model"],
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let started = Instant::now();
        let resp = self.send_with_retry(&body).await?;
        let status = resp.status().as_u16();

        // Per-completion state threaded through the scan closure: SSE line
        // buffer plus capture accumulation.
        let capture_ctx = self.capture.as_ref().map(|w| CaptureCtx {
            writer: Arc::clone(w),
            endpoint: self.chat_url.clone(),
            status,
            headers: redact_headers(&self.request_headers()),
            request: body.clone(),
        });
        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let state = SseState {
            line_buf: String::new(),
            capture: capture_ctx,
            response_text: String::new(),
            usage: None,
            started,
            response_timeout: self.response_timeout,
            backpressure: Arc::clone(&self.backpressure),
        };
        let event_stream = byte_stream
            .scan(state, |state, chunk| {
                let events: Vec<Result<ResponseEvent, ModelError>> = match chunk {
                    Ok(b) => {
                        state.line_buf.push_str(&String::from_utf8_lossy(&b));
                        let mut events = drain_complete_sse_lines(&mut state.line_buf);
                        state.observe(&mut events);
                        events
                    }
                    Err(e) if e.is_timeout() => {
                        vec![Err(ModelError::Timeout(state.response_timeout))]
                    }
                    Err(e) => vec![Err(ModelError::Stream(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Capture context carried through one streamed completion.
struct CaptureCtx {
    writer: Arc<CaptureWriter>,
    endpoint: String,
    status: u16,
    headers: Vec<(String, String)>,
    request: Value,
}

/// Per-completion scan state for the SSE stream.
struct SseState {
    line_buf: String,
    capture: Option<CaptureCtx>,
    response_text: String,
    usage: Option<Usage>,
    started: Instant,
    response_timeout: Duration,
    backpressure: Arc<Mutex<BackpressureMonitor>>,
}

impl SseState {
    /// Observe drained events: accumulate capture state, and on `Done`
    /// record latency (possibly injecting a backpressure warning) and flush
    /// the capture record.
    fn observe(&mut self, events: &mut Vec<Result<ResponseEvent, ModelError>>) {
        let mut warning: Option<String> = None;
        for ev in events.iter() {
            match ev {
                Ok(ResponseEvent::TextDelta(t)) => self.response_text.push_str(t),
                Ok(ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                }) => {
                    self.usage = Some(Usage {
                        input_tokens: *input_tokens,
                        output_tokens: *output_tokens,
                    });
                }
                Ok(ResponseEvent::Done) => {
                    warning = self
                        .backpressure
                        .lock()
                        .unwrap()
                        .record(self.started.elapsed());
                    if let Some(ctx) = self.capture.take() {
                        let record = CaptureRecord {
                            timestamp: chrono::Utc::now(),
                            endpoint: ctx.endpoint,
                            status: ctx.status,
                            headers: ctx.headers,
                            request: ctx.request,
                            response_text: std::mem::take(&mut self.response_text),
                            usage: self.usage,
                        };
                        if let Err(e) = ctx.writer.append(&record) {
                            warn!("capture append failed: {e}");
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some(msg) = warning {
            // Surface before Done so consumers see it within the turn.
            let done_at = events
                .iter()
                .position(|e| matches!(e, Ok(ResponseEvent::Done)))
                .unwrap_or(events.len());
            events.insert(done_at, Ok(ResponseEvent::Warning(msg)));
        }
    }
}

// ─── SSE parsing ──────────────────────────────────────────────────────────────

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable payloads —
/// malformed frames are skipped, never fatal.
fn parse_sse_data_line(line: &str) -> Option<ResponseEvent> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(ResponseEvent::Done);
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk — a single SSE event may span packet boundaries.
pub(crate) fn drain_complete_sse_lines(
    buf: &mut String,
) -> Vec<Result<ResponseEvent, ModelError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(Ok(ev));
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> Option<ResponseEvent> {
    // Usage-only chunk: arrives choice-less as the final frame when
    // stream_options.include_usage is set.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Some(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }

    let delta = &v["choices"][0]["delta"];

    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
            return Some(ResponseEvent::ToolCall {
                index,
                id,
                name,
                arguments: args,
            });
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            return Some(ResponseEvent::TextDelta(text.to_string()));
        }
    }

    None
}

// ─── Wire format ──────────────────────────────────────────────────────────────

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert a transcript into the wire-format JSON array.
///
/// **Parallel tool call coalescing**: the wire format requires all tool
/// calls from one assistant turn inside a single assistant message as a
/// `tool_calls` array.  The engine stores each call as a separate message
/// internally, so consecutive `ToolCall` messages are merged here.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    fn tool_call_to_json(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
        json!({
            "id": tool_call_id,
            "type": "function",
            "function": {
                "name": function.name,
                "arguments": function.arguments,
            }
        })
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if let MessageContent::ToolCall {
            tool_call_id,
            function,
        } = &m.content
        {
            let mut calls = vec![tool_call_to_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall {
                    tool_call_id,
                    function,
                } = &messages[i].content
                {
                    calls.push(tool_call_to_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        };
        result.push(v);
        i += 1;
    }

    result
}

// ─── Rate limiting & backpressure ─────────────────────────────────────────────

/// Tracks recent 503 responses in a sliding window and computes the extra
/// delay to inject once a threshold is exceeded.  Escalation doubles per
/// excess event, capped at `max_backoff`.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    window: Duration,
    threshold: usize,
    base_delay: Duration,
    max_backoff: Duration,
    events: Vec<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(
        window: Duration,
        threshold: usize,
        base_delay: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            window,
            threshold,
            base_delay,
            max_backoff,
            events: Vec::new(),
        }
    }

    pub(crate) fn record_503(&mut self, now: Instant) {
        self.events.push(now);
        self.prune(now);
    }

    pub(crate) fn extra_delay(&mut self, now: Instant) -> Duration {
        self.prune(now);
        let count = self.events.len();
        if count < self.threshold {
            return Duration::ZERO;
        }
        let excess = (count - self.threshold) as u32;
        (self.base_delay * 2u32.saturating_pow(excess)).min(self.max_backoff)
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.events
            .retain(|t| now.saturating_duration_since(*t) <= window);
    }
}

/// Warns when the latest completion time exceeds `multiplier × rolling
/// average` over at least 3 samples.
#[derive(Debug)]
pub(crate) struct BackpressureMonitor {
    multiplier: f32,
    samples: Vec<Duration>,
}

impl BackpressureMonitor {
    pub(crate) fn new(multiplier: f32) -> Self {
        Self {
            multiplier,
            samples: Vec::new(),
        }
    }

    /// Record a completion latency; returns a warning message when the
    /// sample is an outlier against the rolling average of prior samples.
    pub(crate) fn record(&mut self, latest: Duration) -> Option<String> {
        let result = if self.samples.len() >= 3 && self.multiplier > 0.0 {
            let avg = self.samples.iter().sum::<Duration>() / self.samples.len() as u32;
            if latest.as_secs_f32() > avg.as_secs_f32() * self.multiplier {
                Some(format!(
                    "model backpressure: completion took {:.1}s vs {:.1}s rolling average",
                    latest.as_secs_f32(),
                    avg.as_secs_f32()
                ))
            } else {
                None
            }
        } else {
            None
        };
        self.samples.push(latest);
        // Rolling window: keep the last 16 samples.
        if self.samples.len() > 16 {
            self.samples.remove(0);
        }
        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── SSE line buffering ────────────────────────────────────────────────────

    #[test]
    fn drain_complete_lines_handles_single_complete_line() {
        let line = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut buf = format!("data: {line}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(ResponseEvent::TextDelta(t)) if t == "hi"));
        assert!(buf.is_empty(), "buffer should be drained");
    }

    #[test]
    fn drain_complete_lines_retains_incomplete_last_line() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(events.is_empty(), "no complete line yet");
        assert_eq!(buf, partial, "partial line must stay in buffer");
    }

    #[test]
    fn sse_event_split_across_two_chunks_is_parsed_correctly() {
        let full_line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"exec","arguments":""}}]}}]}"#;
        let split = full_line.len() / 2;

        let mut buf = String::new();
        buf.push_str(&full_line[..split]);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());

        buf.push_str(&full_line[split..]);
        buf.push('\n');
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Ok(ResponseEvent::ToolCall { index, id, name, .. }) => {
                assert_eq!(*index, 0);
                assert_eq!(id, "call_1");
                assert_eq!(name, "exec");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn done_sentinel_closes_stream() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(ResponseEvent::Done)));
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let mut buf = "data: {not json at all\ndata: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1, "malformed frame skipped, DONE kept");
        assert!(matches!(events[0], Ok(ResponseEvent::Done)));
    }

    #[test]
    fn windows_crlf_line_endings_are_handled() {
        let line = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut buf = format!("data: {line}\r\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(ResponseEvent::TextDelta(t)) if t == "hi"));
    }

    #[test]
    fn usage_on_choiceless_frame_is_parsed() {
        let v = json!({ "usage": { "prompt_tokens": 100, "completion_tokens": 50 } });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(
            ev,
            ResponseEvent::Usage {
                input_tokens: 100,
                output_tokens: 50
            }
        ));
    }

    #[test]
    fn null_usage_falls_through_to_delta() {
        let v = json!({
            "usage": null,
            "choices": [{ "delta": { "content": "hi" } }]
        });
        let ev = parse_sse_chunk(&v).unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hi"));
    }

    // ── Wire format ───────────────────────────────────────────────────────────

    #[test]
    fn consecutive_tool_calls_coalesced_into_one_assistant_message() {
        let msgs = vec![
            Message::tool_call("call_1", "list_dir", r#"{"path":"."}"#),
            Message::tool_call("call_2", "read_file", r#"{"path":"main.rs"}"#),
            Message::tool_result("call_1", "3 entries"),
            Message::tool_result("call_2", "fn main() {}"),
        ];
        let json = build_wire_messages(&msgs);
        assert_eq!(json.len(), 3);
        assert_eq!(json[0]["role"], "assistant");
        let calls = json[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "call_1");
        assert_eq!(calls[1]["id"], "call_2");
        assert_eq!(json[1]["tool_call_id"], "call_1");
        assert_eq!(json[2]["tool_call_id"], "call_2");
    }

    #[test]
    fn plain_text_message_serialized_as_string_content() {
        let json = build_wire_messages(&[Message::user("hello world")]);
        assert_eq!(json[0]["role"], "user");
        assert_eq!(json[0]["content"], "hello world");
    }

    // ── Rate limiter ──────────────────────────────────────────────────────────

    #[test]
    fn rate_limiter_silent_below_threshold() {
        let mut rl = RateLimiter::new(
            Duration::from_secs(60),
            3,
            Duration::from_millis(500),
            Duration::from_secs(30),
        );
        let now = Instant::now();
        rl.record_503(now);
        rl.record_503(now);
        assert_eq!(rl.extra_delay(now), Duration::ZERO);
    }

    #[test]
    fn rate_limiter_escalates_past_threshold() {
        let mut rl = RateLimiter::new(
            Duration::from_secs(60),
            3,
            Duration::from_millis(500),
            Duration::from_secs(30),
        );
        let now = Instant::now();
        for _ in 0..3 {
            rl.record_503(now);
        }
        assert_eq!(rl.extra_delay(now), Duration::from_millis(500));
        rl.record_503(now);
        assert_eq!(rl.extra_delay(now), Duration::from_millis(1000));
    }

    #[test]
    fn rate_limiter_escalation_is_capped() {
        let mut rl = RateLimiter::new(
            Duration::from_secs(60),
            1,
            Duration::from_millis(500),
            Duration::from_secs(2),
        );
        let now = Instant::now();
        for _ in 0..20 {
            rl.record_503(now);
        }
        assert_eq!(rl.extra_delay(now), Duration::from_secs(2));
    }

    #[test]
    fn rate_limiter_forgets_old_events() {
        let mut rl = RateLimiter::new(
            Duration::from_millis(10),
            1,
            Duration::from_millis(500),
            Duration::from_secs(30),
        );
        let then = Instant::now();
        rl.record_503(then);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(rl.extra_delay(Instant::now()), Duration::ZERO);
    }

    // ── Backpressure monitor ──────────────────────────────────────────────────

    #[test]
    fn backpressure_silent_under_three_samples() {
        let mut m = BackpressureMonitor::new(2.0);
        assert!(m.record(Duration::from_secs(100)).is_none());
        assert!(m.record(Duration::from_secs(100)).is_none());
        assert!(m.record(Duration::from_secs(100)).is_none());
    }

    #[test]
    fn backpressure_warns_on_outlier_after_three_samples() {
        let mut m = BackpressureMonitor::new(2.0);
        for _ in 0..3 {
            m.record(Duration::from_secs(2));
        }
        let warn = m.record(Duration::from_secs(10));
        assert!(warn.is_some(), "10s vs 2s avg should warn at 2x");
    }

    #[test]
    fn backpressure_stays_silent_for_normal_latency() {
        let mut m = BackpressureMonitor::new(2.0);
        for _ in 0..3 {
            m.record(Duration::from_secs(2));
        }
        assert!(m.record(Duration::from_secs(3)).is_none());
    }

    // ── Client construction ───────────────────────────────────────────────────

    #[test]
    fn chat_url_appends_path_and_strips_trailing_slash() {
        let provider = ProviderConfig {
            base_url: "http://localhost:9999/v1/".into(),
            ..ProviderConfig::default()
        };
        let c = ChatClient::from_config("test", &provider, &StreamConfig::default(), None);
        assert_eq!(c.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn request_headers_include_bearer_auth_when_key_present() {
        let provider = ProviderConfig {
            api_key: Some("sk-test".into()),
            ..ProviderConfig::default()
        };
        let c = ChatClient::from_config("test", &provider, &StreamConfig::default(), None);
        let headers = c.request_headers();
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Authorization" && v == "Bearer sk-test"));
    }

    #[test]
    fn body_contains_sanitized_stream_options() {
        let provider = ProviderConfig::default();
        let c = ChatClient::from_config("test", &provider, &StreamConfig::default(), None);
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            stream: true,
            model: Some("m1".into()),
            ..Default::default()
        };
        let body = c.build_body(&req);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["model"], "m1");
    }
}
