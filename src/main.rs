// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{ApprovalModeArg, Cli, Commands, LaneArg};
use tiller_config::{ApprovalMode, Config, Lane};
use tiller_core::{
    Agent, AgentEvent, ApplyErrorClass, EngineSubtaskRunner, HookBus, Presenter, ProgressMsg,
    ProgressSink, ProviderSet,
};
use tiller_guard::ToolLoopGuard;
use tiller_model::{capture::CaptureWriter, ChatClient, ModelProvider};
use tiller_tools::{
    builtin::{
        ApplyPatchTool, EditRangeTool, EditTextTool, ExecTool, GrepTool, InsertFileTool,
        ListDirTool, ReadFileTool, ReadManyTool, SubtaskTool, SysContextTool, VaultNoteTool,
        VaultSearchTool, WriteFileTool,
    },
    ApprovalProvider, ApprovalRequest, CancelToken, Dispatcher, SafetyGate, ToolRegistry,
};
use tiller_vault::{ReplayStore, Vault};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        let config = tiller_config::load(cli.config.as_deref())?;
        return match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                Ok(())
            }
            Commands::Tools { json } => list_tools(&config, *json),
            Commands::Rewind { session, id } => {
                let store = ReplayStore::open(&config.state_dir(), session)?;
                store.rewind(*id)?;
                println!("rewound checkpoint {id} of session {session}");
                Ok(())
            }
            Commands::Checkpoints { session } => {
                let store = ReplayStore::open(&config.state_dir(), session)?;
                for cp in store.checkpoints() {
                    println!(
                        "{:>4}  {:<10} {}{}",
                        cp.id,
                        format!("{:?}", cp.op).to_lowercase(),
                        cp.path.display(),
                        if cp.completed { "" } else { "  (incomplete)" },
                    );
                }
                Ok(())
            }
        };
    }

    let Some(instruction) = cli.instruction.clone() else {
        anyhow::bail!("no instruction given; run `tiller --help`");
    };

    let mut config = tiller_config::load(cli.config.as_deref())?;
    if let Some(mode) = cli.approval {
        config.safety.approval_mode = match mode {
            ApprovalModeArg::Reject => ApprovalMode::Reject,
            ApprovalModeArg::Default => ApprovalMode::Default,
            ApprovalModeArg::AutoEdit => ApprovalMode::AutoEdit,
            ApprovalModeArg::Yolo => ApprovalMode::Yolo,
        };
    }
    if cli.capture {
        config.capture.enabled = true;
    }

    run_ask(Arc::new(config), &instruction, cli.lane).await
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ── Ask execution ─────────────────────────────────────────────────────────────

async fn run_ask(config: Arc<Config>, instruction: &str, lane: Option<LaneArg>) -> anyhow::Result<()> {
    let workdir = std::env::current_dir().context("resolving working directory")?;
    let state_dir = config.state_dir();

    // One session id shared by the vault, replay store, capture files and
    // the agent itself.
    let session_id = uuid::Uuid::new_v4().to_string();
    let vault = Arc::new(Mutex::new(
        Vault::open(&state_dir, &session_id).context("opening vault")?,
    ));
    let replay = ReplayStore::open(&state_dir, &session_id).context("opening replay store")?;

    let providers = build_providers(&config, &state_dir, &session_id)?;

    let safety = Arc::new(SafetyGate::new(
        &config.safety,
        workdir.clone(),
        approval_provider(config.safety.approval_mode),
    ));

    let subtask_runner = Arc::new(EngineSubtaskRunner::new(
        Arc::clone(&config),
        providers.clone(),
        workdir.clone(),
        Box::new({
            let config = Arc::clone(&config);
            let vault = Arc::clone(&vault);
            move || build_registry(&config, Arc::clone(&vault), None, None)
        }),
    ));
    let registry = build_registry(
        &config,
        Arc::clone(&vault),
        Some(subtask_runner),
        None,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        ToolLoopGuard::new(&config.guard),
        safety,
        Some(replay),
    ));

    let hooks = Arc::new(HookBus::new(&config.hooks));
    let mut agent = Agent::new(
        Arc::clone(&config),
        providers,
        Arc::clone(&dispatcher),
        hooks,
        workdir,
    );
    agent.set_session_id(&session_id);
    agent.set_requested_lane(lane.map(|l| match l {
        LaneArg::Fast => Lane::Fast,
        LaneArg::Heavy => Lane::Heavy,
    }));

    // Progress presenter: one actor, stderr sink; final text goes to stdout.
    let mut presenter = Presenter::new(&config.presenter);
    presenter.add_sink(Box::new(StderrSink::default()));
    let (progress_tx, progress_rx) = mpsc::channel(256);
    let presenter_task = tokio::spawn(presenter.run(progress_rx));

    // Ctrl-C cancels cooperatively.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupt: cancelling…");
                cancel.cancel();
            }
        });
    }

    let (tx, mut rx) = mpsc::channel(256);
    let pump = {
        let progress_tx = progress_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = forward_event(&progress_tx, event).await;
            }
        })
    };

    let result = agent.ask_with_cancel(instruction, tx, cancel).await;
    let _ = pump.await;

    let stats = dispatcher.guard_stats();
    tracing::debug!(
        calls = stats.calls_registered,
        replays = stats.deduped_replays,
        cache_hits = stats.read_cache_hits,
        warnings = stats.warnings,
        "guard telemetry"
    );

    match &result {
        Ok(_) => {}
        Err(e) => {
            let _ = progress_tx
                .send(ProgressMsg::AskFailed {
                    kind: e.kind().into(),
                })
                .await;
        }
    }
    drop(progress_tx);
    let _ = presenter_task.await;

    match result {
        Ok(outcome) => {
            println!("{}", outcome.final_text);
            eprintln!(
                "[{} tool calls, {} in / {} out tokens]",
                outcome.tool_call_count, outcome.usage.input_tokens, outcome.usage.output_tokens
            );
            Ok(())
        }
        Err(e) if e.kind() == "cancelled" => {
            // Cancellation is not an error banner; exit quietly.
            std::process::exit(130);
        }
        Err(e) => Err(e.into()),
    }
}

/// Translate agent events into presenter mailbox messages.
async fn forward_event(
    progress_tx: &mpsc::Sender<ProgressMsg>,
    event: AgentEvent,
) -> anyhow::Result<()> {
    let msg = match event {
        AgentEvent::TextDelta(delta) => Some(ProgressMsg::Token(delta)),
        AgentEvent::ToolCallStarted(call) => Some(ProgressMsg::ToolCall {
            id: call.id,
            name: call.name,
        }),
        AgentEvent::ToolCallFinished {
            call_id,
            tool_name,
            is_error,
            error_code,
            ..
        } => Some(ProgressMsg::ToolResult {
            id: call_id,
            name: tool_name,
            success: !is_error,
            code: error_code,
        }),
        AgentEvent::ToolStream {
            call_id,
            stream,
            chunk,
        } => Some(ProgressMsg::ToolStream {
            id: call_id,
            stream,
            chunk,
        }),
        AgentEvent::Warning(w) => {
            eprintln!("warning: {w}");
            None
        }
        AgentEvent::ContextCompacted { before, after, .. } => {
            eprintln!("[context compacted: {before} → {after} tokens]");
            None
        }
        _ => None,
    };
    if let Some(msg) = msg {
        progress_tx.send(msg).await?;
    }
    Ok(())
}

// ── Wiring ────────────────────────────────────────────────────────────────────

fn build_providers(
    config: &Config,
    state_dir: &Path,
    session_id: &str,
) -> anyhow::Result<ProviderSet> {
    let capture = config
        .capture
        .enabled
        .then(|| Arc::new(CaptureWriter::for_session(state_dir, session_id)));

    let mut set = ProviderSet::new();
    for (name, provider_config) in &config.providers {
        let client = ChatClient::from_config(name, provider_config, &config.stream, capture.clone());
        set.insert(name.clone(), Arc::new(client) as Arc<dyn ModelProvider>);
    }
    Ok(set)
}

/// The full builtin tool set.  The subtask runner is absent in child
/// registries so nesting stops at depth one.
fn build_registry(
    config: &Config,
    vault: Arc<Mutex<Vault>>,
    subtask_runner: Option<Arc<EngineSubtaskRunner>>,
    session_log: Option<PathBuf>,
) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(ReadFileTool);
    reg.register(ReadManyTool);
    reg.register(WriteFileTool);
    reg.register(EditTextTool);
    reg.register(EditRangeTool);
    reg.register(InsertFileTool);
    reg.register(ApplyPatchTool);
    reg.register(ListDirTool);
    reg.register(GrepTool);
    reg.register(ExecTool {
        code_timeout_secs: config.safety.exec_timeout_code_secs,
        sys_timeout_secs: config.safety.exec_timeout_sys_secs,
    });
    reg.register(SysContextTool {
        session_log,
    });
    reg.register(VaultNoteTool::new(Arc::clone(&vault)));
    reg.register(VaultSearchTool::new(vault));
    if let Some(runner) = subtask_runner {
        reg.register(SubtaskTool::new(runner));
    }
    reg
}

fn approval_provider(mode: ApprovalMode) -> Box<dyn ApprovalProvider> {
    match mode {
        ApprovalMode::Yolo => Box::new(tiller_tools::AutoApprove),
        _ => Box::new(TerminalApprovals),
    }
}

fn list_tools(config: &Config, json: bool) -> anyhow::Result<()> {
    let vault = Arc::new(Mutex::new(Vault::in_memory()));
    let registry = build_registry(config, vault, None, None);
    for schema in registry.schemas() {
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "name": schema.name,
                    "description": schema.description,
                    "parameters": schema.parameters,
                })
            );
        } else {
            let first_line = schema.description.lines().next().unwrap_or_default();
            println!("{:<14} {}", schema.name, first_line);
        }
    }
    Ok(())
}

// ── Terminal approvals ────────────────────────────────────────────────────────

/// Prompt on stderr, read the decision from stdin.
struct TerminalApprovals;

#[async_trait::async_trait]
impl ApprovalProvider for TerminalApprovals {
    async fn confirm(&self, request: &ApprovalRequest) -> bool {
        let summary = request.summary.clone();
        let answer = tokio::task::spawn_blocking(move || {
            eprint!("approve {summary}? [y/N] ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            line
        })
        .await
        .unwrap_or_default();
        matches!(answer.trim(), "y" | "Y" | "yes")
    }

    async fn confirm_plan(&self, steps: &[String]) -> Vec<bool> {
        let mut decisions = Vec::with_capacity(steps.len());
        for step in steps {
            decisions.push(
                self.confirm(&ApprovalRequest {
                    tool: "plan".into(),
                    args: serde_json::Value::Null,
                    summary: step.clone(),
                    diff: None,
                })
                .await,
            );
        }
        decisions
    }

    fn show_blocked(&self, notice: &str) {
        eprintln!("blocked: {notice}");
    }
}

// ── Progress sink ─────────────────────────────────────────────────────────────

/// Rewrites a rolling progress block on stderr.
#[derive(Default)]
struct StderrSink {
    last_len: usize,
}

impl ProgressSink for StderrSink {
    fn name(&self) -> &str {
        "stderr"
    }

    fn max_len(&self) -> usize {
        2000
    }

    fn apply(&mut self, rendered: &str) -> anyhow::Result<()> {
        // One status line: the last non-empty rendered line.
        let line = rendered.lines().rev().find(|l| !l.trim().is_empty());
        if let Some(line) = line {
            let mut err = std::io::stderr();
            let padded = format!("\r{:<width$}", line, width = self.last_len.max(line.len()));
            err.write_all(padded.as_bytes())?;
            err.flush()?;
            self.last_len = line.len();
        }
        Ok(())
    }

    fn classify_error(&self, _err: &anyhow::Error) -> ApplyErrorClass {
        // stderr writes either work or the terminal is gone.
        ApplyErrorClass::Fatal
    }
}
