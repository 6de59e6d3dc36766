// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The progress presenter: a single actor owning a mailbox of progress
//! messages and producing at most one outbound effect per tick.
//!
//! Incoming events update an intermediate-representation document
//! (header, monospace tool-line block, tail of active tool output, diff
//! block, assistant markdown, failure banner).  A cooperative scheduler
//! polls the dirty flag and applies renders to every sink under throttle
//! rules; apply failures are classified per sink into ignore / retry /
//! fatal, with capped exponential backoff on retry.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use tiller_config::PresenterConfig;
use tiller_tools::StdStream;

/// Mailbox messages.
#[derive(Debug, Clone)]
pub enum ProgressMsg {
    Token(String),
    ToolCall {
        id: String,
        name: String,
    },
    ToolResult {
        id: String,
        name: String,
        success: bool,
        code: Option<String>,
    },
    ToolStream {
        id: String,
        stream: StdStream,
        chunk: String,
    },
    Diff(String),
    AskFailed {
        kind: String,
    },
    UserActivity,
    Heartbeat,
    /// Force an apply regardless of throttle (ask end).
    Flush,
}

/// Lines of live tool output kept in the tail block.
const TAIL_LINES: usize = 8;

/// The renderable document.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub header: String,
    /// One monospace line per tool call, e.g. `▸ exec … ✓`.
    pub tool_lines: Vec<String>,
    /// Rolling tail of the active tool's stdout/stderr.
    pub tail: VecDeque<String>,
    pub diff: Option<String>,
    /// Assistant text streamed so far.
    pub markdown: String,
    /// Failure banner; cleared on the next successful activity.
    pub banner: Option<String>,
}

impl Document {
    /// Serialize for a sink, newest-truncated to `max_len` bytes.
    pub fn render(&self, max_len: usize) -> String {
        let mut out = String::new();
        if let Some(banner) = &self.banner {
            out.push_str(banner);
            out.push('\n');
        }
        if !self.header.is_empty() {
            out.push_str(&self.header);
            out.push('\n');
        }
        if !self.tool_lines.is_empty() {
            out.push_str("```\n");
            for line in &self.tool_lines {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("```\n");
        }
        if !self.tail.is_empty() {
            out.push_str("```\n");
            for line in &self.tail {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("```\n");
        }
        if let Some(diff) = &self.diff {
            out.push_str("```diff\n");
            out.push_str(diff);
            if !diff.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```\n");
        }
        out.push_str(&self.markdown);

        if out.len() > max_len {
            // Keep the end: the newest content matters most.
            let cut = out.len() - max_len;
            let mut start = cut;
            while !out.is_char_boundary(start) {
                start += 1;
            }
            out = format!("…{}", &out[start..]);
        }
        out
    }
}

/// Classification of one failed apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorClass {
    /// Drop the error; try again next tick.
    Ignore,
    /// Retry after the given delay.
    Retry(Duration),
    /// Stop the scheduler for this sink.
    Fatal,
}

/// One progress destination: terminal line, chat message editor, …
pub trait ProgressSink: Send {
    fn name(&self) -> &str;
    /// Per-sink serialized length cap.
    fn max_len(&self) -> usize {
        4000
    }
    fn apply(&mut self, rendered: &str) -> anyhow::Result<()>;
    /// Platform-specific classification of apply failures.
    fn classify_error(&self, _err: &anyhow::Error) -> ApplyErrorClass {
        ApplyErrorClass::Retry(Duration::from_millis(500))
    }
}

/// Throttle clocks: updates apply only when user activity was recent, the
/// heartbeat is due, or the progress interval elapsed since the last
/// successful apply.
#[derive(Debug)]
pub struct Throttle {
    progress_interval: Duration,
    heartbeat_interval: Duration,
    last_apply: Option<Instant>,
    last_user_activity: Option<Instant>,
}

impl Throttle {
    pub fn new(config: &PresenterConfig) -> Self {
        Self {
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            last_apply: None,
            last_user_activity: None,
        }
    }

    pub fn note_user_activity(&mut self, now: Instant) {
        self.last_user_activity = Some(now);
    }

    pub fn note_apply(&mut self, now: Instant) {
        self.last_apply = Some(now);
    }

    pub fn should_apply(&self, now: Instant) -> bool {
        let Some(last) = self.last_apply else {
            return true; // nothing shown yet
        };
        if let Some(activity) = self.last_user_activity {
            if now.duration_since(activity) < self.progress_interval {
                return true;
            }
        }
        if now.duration_since(last) >= self.heartbeat_interval {
            return true;
        }
        now.duration_since(last) >= self.progress_interval
    }
}

struct SinkState {
    sink: Box<dyn ProgressSink>,
    /// Consecutive failed applies, for backoff escalation.
    failures: u32,
    /// Earliest instant the next apply may run.
    not_before: Option<Instant>,
    stopped: bool,
}

pub struct Presenter {
    doc: Document,
    dirty: bool,
    throttle: Throttle,
    sinks: Vec<SinkState>,
    max_backoff: Duration,
    /// Single-flight: set while an apply pass runs so renders never overlap.
    applying: bool,
}

impl Presenter {
    pub fn new(config: &PresenterConfig) -> Self {
        Self {
            doc: Document::default(),
            dirty: false,
            throttle: Throttle::new(config),
            sinks: Vec::new(),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            applying: false,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn ProgressSink>) {
        self.sinks.push(SinkState {
            sink,
            failures: 0,
            not_before: None,
            stopped: false,
        });
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Fold one mailbox message into the document.
    pub fn handle(&mut self, msg: ProgressMsg, now: Instant) {
        match msg {
            ProgressMsg::Token(delta) => {
                self.doc.markdown.push_str(&delta);
                self.doc.banner = None;
                self.dirty = true;
            }
            ProgressMsg::ToolCall { name, .. } => {
                self.doc.tool_lines.push(format!("▸ {name} …"));
                self.doc.tail.clear();
                self.dirty = true;
            }
            ProgressMsg::ToolResult {
                name,
                success,
                code,
                ..
            } => {
                if let Some(line) = self
                    .doc
                    .tool_lines
                    .iter_mut()
                    .rev()
                    .find(|l| l.contains(&name) && l.ends_with('…'))
                {
                    let mark = if success { "✓" } else { "✗" };
                    *line = format!("▸ {name} {mark}");
                }
                if success {
                    self.doc.banner = None;
                } else {
                    let code = code.unwrap_or_else(|| "internal".into());
                    self.doc.banner = Some(format!("⚠ Tool failed: {name} ({code})"));
                }
                self.doc.tail.clear();
                self.dirty = true;
            }
            ProgressMsg::ToolStream { chunk, .. } => {
                self.doc.tail.push_back(chunk);
                while self.doc.tail.len() > TAIL_LINES {
                    self.doc.tail.pop_front();
                }
                self.dirty = true;
            }
            ProgressMsg::Diff(diff) => {
                self.doc.diff = Some(diff);
                self.dirty = true;
            }
            ProgressMsg::AskFailed { kind } => {
                self.doc.banner = Some(format!("⚠ Ask failed: {kind}"));
                self.dirty = true;
            }
            ProgressMsg::UserActivity => self.throttle.note_user_activity(now),
            ProgressMsg::Heartbeat => {
                // A heartbeat alone only forces a render when due; handled
                // by the throttle in tick().
                self.dirty = true;
            }
            ProgressMsg::Flush => {
                self.dirty = true;
                self.throttle.last_apply = None; // bypass throttle once
            }
        }
    }

    /// One scheduler tick: at most one render + apply pass.
    ///
    /// Returns true when an apply pass ran.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.dirty || self.applying || !self.throttle.should_apply(now) {
            return false;
        }
        self.applying = true;

        let mut all_applied = true;
        for state in self.sinks.iter_mut().filter(|s| !s.stopped) {
            if let Some(t) = state.not_before {
                if now < t {
                    all_applied = false;
                    continue;
                }
            }
            let rendered = self.doc.render(state.sink.max_len());
            match state.sink.apply(&rendered) {
                Ok(()) => {
                    state.failures = 0;
                    state.not_before = None;
                }
                Err(e) => match state.sink.classify_error(&e) {
                    ApplyErrorClass::Ignore => {
                        debug!(sink = state.sink.name(), "apply error ignored: {e}");
                    }
                    ApplyErrorClass::Retry(base) => {
                        state.failures += 1;
                        let backoff = base * 2u32.saturating_pow(state.failures - 1);
                        // Deterministic jitter keeps retries from aligning
                        // across sinks without pulling in an RNG.
                        let jitter = Duration::from_millis((state.failures as u64 * 37) % 250);
                        let delay = (backoff + jitter).min(self.max_backoff);
                        state.not_before = Some(now + delay);
                        all_applied = false;
                        warn!(
                            sink = state.sink.name(),
                            failures = state.failures,
                            delay_ms = delay.as_millis() as u64,
                            "apply failed; backing off"
                        );
                    }
                    ApplyErrorClass::Fatal => {
                        warn!(sink = state.sink.name(), "fatal apply error; sink stopped: {e}");
                        state.stopped = true;
                    }
                },
            }
        }

        if all_applied {
            self.dirty = false;
            self.throttle.note_apply(now);
        }
        self.applying = false;
        true
    }

    /// Actor loop: drain the mailbox, tick on an interval, exit when the
    /// sender side closes (after a final flush).
    pub async fn run(mut self, mut rx: mpsc::Receiver<ProgressMsg>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg, Instant::now()),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
            }
        }
        self.handle(ProgressMsg::Flush, Instant::now());
        self.tick(Instant::now());
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone)]
    struct MemorySink {
        applies: Arc<Mutex<Vec<String>>>,
        fail_times: Arc<Mutex<u32>>,
        fatal: bool,
    }

    impl MemorySink {
        fn new() -> Self {
            Self {
                applies: Arc::new(Mutex::new(Vec::new())),
                fail_times: Arc::new(Mutex::new(0)),
                fatal: false,
            }
        }
    }

    impl ProgressSink for MemorySink {
        fn name(&self) -> &str {
            "memory"
        }
        fn max_len(&self) -> usize {
            200
        }
        fn apply(&mut self, rendered: &str) -> anyhow::Result<()> {
            let mut failures = self.fail_times.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("edit rejected");
            }
            self.applies.lock().unwrap().push(rendered.to_string());
            Ok(())
        }
        fn classify_error(&self, _err: &anyhow::Error) -> ApplyErrorClass {
            if self.fatal {
                ApplyErrorClass::Fatal
            } else {
                ApplyErrorClass::Retry(Duration::from_millis(100))
            }
        }
    }

    fn presenter_with_sink() -> (Presenter, MemorySink) {
        let mut p = Presenter::new(&PresenterConfig::default());
        let sink = MemorySink::new();
        p.add_sink(Box::new(sink.clone()));
        (p, sink)
    }

    #[test]
    fn first_apply_is_immediate() {
        let (mut p, sink) = presenter_with_sink();
        let now = Instant::now();
        p.handle(ProgressMsg::Token("hello".into()), now);
        assert!(p.tick(now));
        assert_eq!(sink.applies.lock().unwrap().len(), 1);
        assert!(sink.applies.lock().unwrap()[0].contains("hello"));
    }

    #[test]
    fn updates_suppressed_within_progress_interval() {
        let (mut p, sink) = presenter_with_sink();
        let t0 = Instant::now();
        p.handle(ProgressMsg::Token("a".into()), t0);
        p.tick(t0);
        // One second later: inside the 3 s progress interval, no heartbeat
        // due, no user activity → suppressed.
        let t1 = t0 + Duration::from_secs(1);
        p.handle(ProgressMsg::Token("b".into()), t1);
        p.tick(t1);
        assert_eq!(sink.applies.lock().unwrap().len(), 1);
        // After the interval the pending content flushes.
        let t2 = t0 + Duration::from_millis(3100);
        p.tick(t2);
        assert_eq!(sink.applies.lock().unwrap().len(), 2);
    }

    #[test]
    fn recent_user_activity_bypasses_interval() {
        let (mut p, sink) = presenter_with_sink();
        let t0 = Instant::now();
        p.handle(ProgressMsg::Token("a".into()), t0);
        p.tick(t0);
        let t1 = t0 + Duration::from_secs(1);
        p.handle(ProgressMsg::UserActivity, t1);
        p.handle(ProgressMsg::Token("b".into()), t1);
        p.tick(t1);
        assert_eq!(sink.applies.lock().unwrap().len(), 2);
    }

    #[test]
    fn clean_document_is_not_reapplied() {
        let (mut p, sink) = presenter_with_sink();
        let t0 = Instant::now();
        p.handle(ProgressMsg::Token("a".into()), t0);
        p.tick(t0);
        let t1 = t0 + Duration::from_secs(10);
        p.tick(t1); // dirty is false — nothing to do
        assert_eq!(sink.applies.lock().unwrap().len(), 1);
    }

    #[test]
    fn tool_lines_render_in_monospace_block() {
        let (mut p, _sink) = presenter_with_sink();
        let now = Instant::now();
        p.handle(
            ProgressMsg::ToolCall {
                id: "c1".into(),
                name: "exec".into(),
            },
            now,
        );
        let rendered = p.document().render(1000);
        assert!(rendered.contains("```\n▸ exec …\n```"), "{rendered}");
    }

    #[test]
    fn tool_result_marks_line_and_failure_banner() {
        let (mut p, _sink) = presenter_with_sink();
        let now = Instant::now();
        p.handle(
            ProgressMsg::ToolCall {
                id: "c1".into(),
                name: "exec".into(),
            },
            now,
        );
        p.handle(
            ProgressMsg::ToolResult {
                id: "c1".into(),
                name: "exec".into(),
                success: false,
                code: Some("timeout".into()),
            },
            now,
        );
        let rendered = p.document().render(1000);
        assert!(rendered.contains("⚠ Tool failed: exec (timeout)"), "{rendered}");
        assert!(rendered.contains("▸ exec ✗"));
    }

    #[test]
    fn banner_cleared_on_next_success() {
        let (mut p, _sink) = presenter_with_sink();
        let now = Instant::now();
        p.handle(
            ProgressMsg::ToolResult {
                id: "c1".into(),
                name: "exec".into(),
                success: false,
                code: Some("timeout".into()),
            },
            now,
        );
        assert!(p.document().banner.is_some());
        p.handle(ProgressMsg::Token("recovering".into()), now);
        assert!(p.document().banner.is_none());
    }

    #[test]
    fn tail_block_is_bounded() {
        let (mut p, _sink) = presenter_with_sink();
        let now = Instant::now();
        for i in 0..20 {
            p.handle(
                ProgressMsg::ToolStream {
                    id: "c1".into(),
                    stream: StdStream::Stdout,
                    chunk: format!("line {i}"),
                },
                now,
            );
        }
        assert_eq!(p.document().tail.len(), TAIL_LINES);
        assert_eq!(p.document().tail.back().unwrap(), "line 19");
    }

    #[test]
    fn render_truncates_to_max_len_keeping_tail() {
        let mut doc = Document::default();
        doc.markdown = format!("{}END", "x".repeat(500));
        let rendered = doc.render(100);
        assert!(rendered.len() <= 101, "len = {}", rendered.len());
        assert!(rendered.ends_with("END"));
        assert!(rendered.starts_with('…'));
    }

    #[test]
    fn failed_apply_retries_with_backoff() {
        let mut p = Presenter::new(&PresenterConfig::default());
        let sink = MemorySink::new();
        *sink.fail_times.lock().unwrap() = 1;
        p.add_sink(Box::new(sink.clone()));

        let t0 = Instant::now();
        p.handle(ProgressMsg::Token("a".into()), t0);
        p.tick(t0);
        assert_eq!(sink.applies.lock().unwrap().len(), 0, "first apply failed");
        assert!(p.is_dirty(), "document stays dirty after failure");

        // Before the backoff expires nothing happens.
        p.tick(t0 + Duration::from_millis(10));
        assert_eq!(sink.applies.lock().unwrap().len(), 0);

        // After the backoff the retry succeeds.
        p.tick(t0 + Duration::from_millis(500));
        assert_eq!(sink.applies.lock().unwrap().len(), 1);
    }

    #[test]
    fn fatal_apply_stops_sink() {
        let mut p = Presenter::new(&PresenterConfig::default());
        let mut sink = MemorySink::new();
        sink.fatal = true;
        *sink.fail_times.lock().unwrap() = 99;
        p.add_sink(Box::new(sink.clone()));

        let t0 = Instant::now();
        p.handle(ProgressMsg::Token("a".into()), t0);
        p.tick(t0);
        // Sink stopped: later ticks never reach it again.
        p.handle(ProgressMsg::Flush, t0);
        p.tick(t0 + Duration::from_secs(10));
        assert_eq!(sink.applies.lock().unwrap().len(), 0);
    }

    #[test]
    fn flush_bypasses_throttle() {
        let (mut p, sink) = presenter_with_sink();
        let t0 = Instant::now();
        p.handle(ProgressMsg::Token("a".into()), t0);
        p.tick(t0);
        let t1 = t0 + Duration::from_millis(100);
        p.handle(ProgressMsg::Token("b".into()), t1);
        p.handle(ProgressMsg::Flush, t1);
        p.tick(t1);
        assert_eq!(sink.applies.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn actor_drains_mailbox_and_flushes_on_close() {
        let sink = MemorySink::new();
        let mut p = Presenter::new(&PresenterConfig::default());
        p.add_sink(Box::new(sink.clone()));

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(p.run(rx));
        tx.send(ProgressMsg::Token("final answer".into())).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let applies = sink.applies.lock().unwrap();
        assert!(applies.iter().any(|a| a.contains("final answer")));
    }
}
