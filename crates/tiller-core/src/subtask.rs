// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Subtask execution: a nested engine over the same workspace with its
//! own caps and approval mode.  Depth is limited to one — the child
//! registry never contains the subtask tool.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use tiller_config::{ApprovalMode, Config};
use tiller_guard::ToolLoopGuard;
use tiller_tools::{
    builtin::{SubtaskRunner, SubtaskSpec},
    safety::{AutoApprove, AutoDeny},
    ApprovalProvider, Dispatcher, ErrorCode, SafetyGate, ToolError, ToolRegistry,
};

use crate::{
    agent::{Agent, AskError, ProviderSet},
    hooks::HookBus,
};

/// Builds the child tool registry; supplied by the binary so the runner
/// does not hard-code the tool set.
pub type RegistryBuilder = Box<dyn Fn() -> ToolRegistry + Send + Sync>;

pub struct EngineSubtaskRunner {
    config: Arc<Config>,
    providers: ProviderSet,
    workdir: PathBuf,
    build_registry: RegistryBuilder,
}

impl EngineSubtaskRunner {
    pub fn new(
        config: Arc<Config>,
        providers: ProviderSet,
        workdir: PathBuf,
        build_registry: RegistryBuilder,
    ) -> Self {
        Self {
            config,
            providers,
            workdir,
            build_registry,
        }
    }
}

#[async_trait]
impl SubtaskRunner for EngineSubtaskRunner {
    async fn run(&self, spec: SubtaskSpec) -> Result<String, ToolError> {
        let mut config = (*self.config).clone();
        if let Some(mi) = spec.max_iterations {
            config.agent.max_iterations = mi;
        }
        if let Some(t) = spec.timeout_sec {
            config.agent.ask_timeout_secs = t;
        }
        // `plan` runs the child read-only: edits and cautious exec refuse.
        let mode = match spec.approval_mode.as_deref() {
            Some("plan") | Some("reject") => ApprovalMode::Reject,
            Some("auto-edit") => ApprovalMode::AutoEdit,
            Some("yolo") => ApprovalMode::Yolo,
            _ => ApprovalMode::Default,
        };
        config.safety.approval_mode = mode;
        let config = Arc::new(config);

        // Headless child: yolo approves silently, everything else denies
        // prompts rather than hanging on input nobody can answer.
        let approvals: Box<dyn ApprovalProvider> = if mode == ApprovalMode::Yolo {
            Box::new(AutoApprove)
        } else {
            Box::new(AutoDeny)
        };
        let safety = Arc::new(SafetyGate::new(
            &config.safety,
            self.workdir.clone(),
            approvals,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new((self.build_registry)()),
            ToolLoopGuard::new(&config.guard),
            safety,
            None,
        ));

        let hooks = Arc::new(HookBus::new(&config.hooks));
        let mut agent = Agent::new(
            Arc::clone(&config),
            self.providers.clone(),
            dispatcher,
            hooks,
            self.workdir.clone(),
        );
        agent.set_token_budget(spec.max_tokens.map(u64::from));

        debug!(task = %spec.task, "running subtask engine");
        // The child's event stream is drained and discarded; the parent
        // only consumes the final text.
        let (tx, mut rx) = mpsc::channel(256);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = agent.ask(&spec.task, tx).await;
        let _ = drain.await;

        match result {
            Ok(outcome) => Ok(outcome.final_text),
            Err(AskError::ResponseTimeout) => Err(ToolError::new(
                ErrorCode::Timeout,
                "subtask deadline exceeded",
            )),
            Err(AskError::MaxIterations(n)) => Err(ToolError::new(
                ErrorCode::Internal,
                format!("subtask hit its iteration cap ({n})"),
            )),
            Err(AskError::Model(e)) if e.is_transient() => Err(ToolError::new(
                ErrorCode::Transient,
                format!("subtask model failure: {e}"),
            )),
            Err(e) => Err(ToolError::new(
                ErrorCode::Internal,
                format!("subtask failed: {e}"),
            )),
        }
    }
}
