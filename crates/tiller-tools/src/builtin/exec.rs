// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::tool::{
    ErrorCode, StdStream, Tool, ToolCall, ToolCtx, ToolError, ToolOutput, ToolStreamChunk,
};
use crate::validate::ArgSpec;

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines kept from the head of oversized output.
const HEAD_LINES: usize = 100;

/// Lines kept from the tail.  Errors and summaries almost always appear at
/// the end of build/test output, so the tail matters as much as the head.
const TAIL_LINES: usize = 100;

/// Absolute ceiling on the per-call timeout.
const MAX_TIMEOUT_SECS: u64 = 120;

/// Which default timeout applies when the caller does not pass one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Build/test/file commands: 30 s default.
    Code,
    /// System administration commands: 60 s default.
    Sys,
}

impl ExecMode {
    fn default_timeout(self) -> u64 {
        match self {
            ExecMode::Code => 30,
            ExecMode::Sys => 60,
        }
    }
}

/// Run a shell command with live output streaming and process-group
/// cleanup on timeout or cancel.
pub struct ExecTool {
    pub code_timeout_secs: u64,
    pub sys_timeout_secs: u64,
}

impl Default for ExecTool {
    fn default() -> Self {
        Self {
            code_timeout_secs: ExecMode::Code.default_timeout(),
            sys_timeout_secs: ExecMode::Sys.default_timeout(),
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         Output is capped at ~20 KB; when larger, the first and last 100\n\
         lines are preserved with an omission marker in the middle.\n\
         Prefer non-interactive commands; anything needing a TTY will hang\n\
         until the timeout. Do NOT use exec for file operations — use\n\
         read_file / grep / list_dir / edit_text instead."
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::new()
            .string("command", true, "The shell command to execute")
            .integer("timeout", false, 1, MAX_TIMEOUT_SECS as i64, "Timeout in seconds")
            .enumeration(
                "mode",
                false,
                &["code", "sys"],
                "Timeout profile: code (30 s) or sys (60 s)",
            )
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let command = call.args["command"].as_str().unwrap_or_default().to_string();
        let mode = match call.args.get("mode").and_then(Value::as_str) {
            Some("sys") => ExecMode::Sys,
            _ => ExecMode::Code,
        };
        let default = match mode {
            ExecMode::Code => self.code_timeout_secs,
            ExecMode::Sys => self.sys_timeout_secs,
        };
        let timeout_secs = call
            .args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(default)
            .clamp(1, MAX_TIMEOUT_SECS);

        debug!(cmd = %command, timeout_secs, "exec");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        cmd.current_dir(&ctx.workdir);
        // stdin from /dev/null so the child cannot touch the controlling
        // terminal; kill_on_drop as a backstop against leaked processes.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // The child gets its own process group so cancellation can signal
        // the whole tree, not just the immediate bash.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolError::new(ErrorCode::Internal, format!("spawn error: {e}")),
                )
            }
        };
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);

        let stdout = child.stdout.take().expect("stdout piped above");
        let stderr = child.stderr.take().expect("stderr piped above");
        let out_task = tokio::spawn(drain_stream(
            stdout,
            StdStream::Stdout,
            call.id.clone(),
            ctx.stream.clone(),
        ));
        let err_task = tokio::spawn(drain_stream(
            stderr,
            StdStream::Stderr,
            call.id.clone(),
            ctx.stream.clone(),
        ));

        enum Ending {
            Finished(std::process::ExitStatus),
            WaitError(String),
            TimedOut,
            Cancelled,
        }

        // The wait future borrows the child, so the select block only
        // classifies the ending; killing and reaping happen afterwards.
        let ending = {
            let wait = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait());
            tokio::pin!(wait);
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Ending::Cancelled,
                r = &mut wait => match r {
                    Ok(Ok(status)) => Ending::Finished(status),
                    Ok(Err(e)) => Ending::WaitError(e.to_string()),
                    Err(_) => Ending::TimedOut,
                },
            }
        };
        if matches!(ending, Ending::Cancelled | Ending::TimedOut) {
            kill_process_group(pid);
            let _ = child.wait().await;
        }

        let stdout_text = out_task.await.unwrap_or_default();
        let stderr_text = err_task.await.unwrap_or_default();

        let mut content = String::new();
        if !stdout_text.is_empty() {
            content.push_str(&head_tail_truncate(&stdout_text));
        }
        if !stderr_text.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&head_tail_truncate(&stderr_text));
        }

        match ending {
            Ending::Cancelled => ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::Internal, "command cancelled"),
            ),
            Ending::WaitError(e) => ToolOutput::err(
                &call.id,
                ToolError::new(ErrorCode::Internal, format!("wait error: {e}")),
            ),
            Ending::TimedOut => ToolOutput::err(
                &call.id,
                ToolError::new(
                    ErrorCode::Timeout,
                    format!("timeout after {timeout_secs}s"),
                )
                .with_hint("raise timeout (max 120) or run a shorter command"),
            ),
            Ending::Finished(status) => {
                let code = status.code().unwrap_or(-1);
                if content.is_empty() {
                    content = format!("[exit {code}]");
                }
                if code == 0 {
                    ToolOutput::ok(&call.id, content)
                } else if code == 1 {
                    // Exit 1 is the Unix convention for "no matches" and
                    // "condition false", not a hard failure.
                    ToolOutput::ok(&call.id, format!("[exit 1]\n{content}"))
                } else {
                    ToolOutput::err(
                        &call.id,
                        ToolError::new(
                            ErrorCode::Internal,
                            format!("[exit {code}]\n{content}"),
                        ),
                    )
                }
            }
        }
    }
}

/// Read one std stream to the end, forwarding each line as a live chunk.
async fn drain_stream(
    stream: impl tokio::io::AsyncRead + Unpin,
    which: StdStream,
    call_id: String,
    tx: Option<mpsc::Sender<ToolStreamChunk>>,
) -> String {
    let mut reader = BufReader::new(stream).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = reader.next_line().await {
        if let Some(tx) = &tx {
            let _ = tx
                .send(ToolStreamChunk {
                    call_id: call_id.clone(),
                    stream: which,
                    chunk: line.clone(),
                })
                .await;
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

/// SIGKILL the whole process group.  The child was made a session leader
/// with setsid, so its pid is the pgid.
fn kill_process_group(pid: i32) {
    if pid <= 0 {
        return;
    }
    #[cfg(unix)]
    unsafe {
        if libc::killpg(pid, libc::SIGKILL) != 0 {
            warn!(pid, "killpg failed: {}", std::io::Error::last_os_error());
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Truncate `s` to fit within `OUTPUT_LIMIT_BYTES`, keeping the first
/// `HEAD_LINES` and last `TAIL_LINES` with an omission marker in between.
pub(crate) fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded by very long lines: fall back to byte-level
        // head + tail windows.
        let head = &s[..OUTPUT_LIMIT_BYTES / 2];
        let tail = &s[s.len() - OUTPUT_LIMIT_BYTES / 2..];
        let omitted = s.len() - head.len() - tail.len();
        return format!("{head}\n...[{omitted} bytes omitted]...\n{tail}");
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    let omitted_bytes = s.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n...[{omitted_lines} lines / ~{omitted_bytes} bytes omitted]...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
