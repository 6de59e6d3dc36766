// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Safety & approval gate.
//!
//! Every side-effecting call the dispatcher makes passes through here:
//! path confinement for file-operating tools, tier classification for
//! exec, and the approval-provider flow for anything the active mode does
//! not allow silently.  The session approval mode lives in this gate and
//! in config only — a `--yolo` flag inside a tool command never changes it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use tiller_config::{ApprovalMode, SafetyConfig};

use crate::signature::stable_json;
use crate::tool::{ErrorCode, ToolError};

/// Risk tier of one shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTier {
    /// Runs without asking.
    Safe,
    /// Requires user confirmation unless the mode says otherwise.
    Cautious,
    /// Always refused, in every mode.
    Forbidden,
}

/// One approval request shown to the user.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool: String,
    pub args: Value,
    pub summary: String,
    pub diff: Option<String>,
}

/// Uniform interface over terminal prompts, chat-button flows and TUI
/// modals.
#[async_trait]
pub trait ApprovalProvider: Send + Sync {
    async fn confirm(&self, request: &ApprovalRequest) -> bool;
    /// Per-step decisions for an ordered plan.
    async fn confirm_plan(&self, steps: &[String]) -> Vec<bool>;
    fn show_blocked(&self, notice: &str);
}

/// Approves everything.  Used by `yolo` sessions and tests.
pub struct AutoApprove;

#[async_trait]
impl ApprovalProvider for AutoApprove {
    async fn confirm(&self, _request: &ApprovalRequest) -> bool {
        true
    }
    async fn confirm_plan(&self, steps: &[String]) -> Vec<bool> {
        vec![true; steps.len()]
    }
    fn show_blocked(&self, _notice: &str) {}
}

/// Denies everything.  Used by tests and headless batch runs.
pub struct AutoDeny;

#[async_trait]
impl ApprovalProvider for AutoDeny {
    async fn confirm(&self, _request: &ApprovalRequest) -> bool {
        false
    }
    async fn confirm_plan(&self, steps: &[String]) -> Vec<bool> {
        vec![false; steps.len()]
    }
    fn show_blocked(&self, _notice: &str) {}
}

/// The resolution of a path-confinement or exec check that passed.
#[derive(Debug, Clone, Default)]
pub struct Cleared {
    /// A non-fatal warning to append to the tool result.
    pub warning: Option<String>,
}

pub struct SafetyGate {
    mode: ApprovalMode,
    /// Allow-list of root directories (home by default, plus extras).
    roots: Vec<PathBuf>,
    /// The session working root; operations outside it are mode-gated.
    workdir: PathBuf,
    approvals: Box<dyn ApprovalProvider>,
    remembered: Mutex<HashSet<(String, String)>>,
    extra_forbidden: Vec<String>,
}

impl SafetyGate {
    pub fn new(
        config: &SafetyConfig,
        workdir: PathBuf,
        approvals: Box<dyn ApprovalProvider>,
    ) -> Self {
        let workdir = workdir.canonicalize().unwrap_or(workdir);
        let mut roots = Vec::new();
        if let Some(home) = dirs::home_dir() {
            roots.push(home);
        }
        for extra in &config.extra_roots {
            roots.push(PathBuf::from(shellexpand::tilde(extra).into_owned()));
        }
        // The working root is always allowed, even outside home (CI jobs
        // run from /tmp or /workspace).
        roots.push(workdir.clone());
        Self {
            mode: config.approval_mode,
            roots,
            workdir,
            approvals,
            remembered: Mutex::new(HashSet::new()),
            extra_forbidden: config.forbidden_commands.clone(),
        }
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    /// Forget all remembered approvals.
    pub fn clear_remembered(&self) {
        self.remembered.lock().unwrap().clear();
    }

    /// Resolve a tool-supplied path: expand `~`, anchor relative paths at
    /// the working root, canonicalize, and enforce confinement.
    ///
    /// Inside the working root → allowed.  Under an allow-listed root but
    /// outside the working root → allowed with a warning under
    /// `yolo`/`auto-edit`, rejected otherwise.  Outside every allow-listed
    /// root → always rejected.
    pub fn resolve_path(&self, raw: &str) -> Result<(PathBuf, Cleared), ToolError> {
        let expanded = shellexpand::tilde(raw).into_owned();
        let joined = if Path::new(&expanded).is_absolute() {
            PathBuf::from(&expanded)
        } else {
            self.workdir.join(&expanded)
        };
        let resolved = canonicalize_lenient(&joined);

        if resolved.starts_with(&self.workdir) {
            return Ok((resolved, Cleared::default()));
        }
        let under_root = self.roots.iter().any(|r| resolved.starts_with(r));
        if !under_root {
            return Err(ToolError::new(
                ErrorCode::Blocked,
                format!("path {} is outside every allowed root", resolved.display()),
            )
            .with_hint("operate on files under the working directory"));
        }
        match self.mode {
            ApprovalMode::Yolo | ApprovalMode::AutoEdit => Ok((
                resolved.clone(),
                Cleared {
                    warning: Some(format!(
                        "warning: {} is outside the working root",
                        resolved.display()
                    )),
                },
            )),
            _ => Err(ToolError::new(
                ErrorCode::Blocked,
                format!(
                    "path {} is outside the working root (approval mode {})",
                    resolved.display(),
                    self.mode
                ),
            )),
        }
    }

    /// Gate a shell command: tier classification, navigation confinement,
    /// then the approval flow for cautious commands.
    pub async fn gate_exec(&self, call_id: &str, command: &str) -> Result<Cleared, ToolError> {
        debug!(call_id, command, "gating exec");
        match classify_command(command, &self.extra_forbidden) {
            ExecTier::Forbidden => {
                let notice = format!("forbidden command refused: {command}");
                self.approvals.show_blocked(&notice);
                return Err(ToolError::new(ErrorCode::Blocked, notice));
            }
            ExecTier::Cautious => {
                if self.mode == ApprovalMode::Reject {
                    return Err(ToolError::new(
                        ErrorCode::Blocked,
                        "cautious command refused (approval mode reject)",
                    ));
                }
                if self.mode != ApprovalMode::Yolo {
                    self.require_approval("exec", &serde_json::json!({ "command": command }), command)
                        .await?;
                }
            }
            ExecTier::Safe => {}
        }

        // Navigation out of the working root is handled like path
        // confinement: `cd` targets and absolute targets of mutating
        // commands must stay confined.
        let mut warning = None;
        for target in navigation_targets(command, &self.workdir) {
            let resolved = canonicalize_lenient(&target);
            if resolved.starts_with(&self.workdir) {
                continue;
            }
            match self.mode {
                ApprovalMode::Yolo | ApprovalMode::AutoEdit => {
                    warning = Some(format!(
                        "warning: command navigates outside the working root ({})",
                        resolved.display()
                    ));
                }
                _ => {
                    return Err(ToolError::new(
                        ErrorCode::Blocked,
                        format!(
                            "command navigates outside the working root ({})",
                            resolved.display()
                        ),
                    ));
                }
            }
        }
        Ok(Cleared { warning })
    }

    /// Gate a file edit (write, edit, insert, patch) after its path has
    /// already been confined.
    pub async fn gate_edit(
        &self,
        tool: &str,
        args: &Value,
        summary: &str,
    ) -> Result<(), ToolError> {
        match self.mode {
            ApprovalMode::Reject => Err(ToolError::new(
                ErrorCode::Blocked,
                "edit refused (approval mode reject)",
            )),
            ApprovalMode::Yolo | ApprovalMode::AutoEdit => Ok(()),
            ApprovalMode::Default => self.require_approval(tool, args, summary).await,
        }
    }

    /// Run the remembered-approvals layer, then the provider.
    async fn require_approval(
        &self,
        tool: &str,
        args: &Value,
        summary: &str,
    ) -> Result<(), ToolError> {
        let key = (tool.to_string(), stable_json(args));
        if self.remembered.lock().unwrap().contains(&key) {
            debug!(tool, "approval served from remembered layer");
            return Ok(());
        }
        let request = ApprovalRequest {
            tool: tool.to_string(),
            args: args.clone(),
            summary: summary.to_string(),
            diff: None,
        };
        if self.approvals.confirm(&request).await {
            self.remembered.lock().unwrap().insert(key);
            Ok(())
        } else {
            warn!(tool, "approval denied by user");
            Err(ToolError::new(ErrorCode::Blocked, "approval denied"))
        }
    }
}

/// Best-effort canonicalization: resolve the longest existing ancestor and
/// re-attach the remaining components, so paths to not-yet-existing files
/// still normalize `..` and symlinks.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut base = existing.canonicalize().unwrap_or(existing);
    for name in tail.into_iter().rev() {
        // `..` components in the non-existing tail still need resolving.
        if name == ".." {
            base.pop();
        } else if name != "." {
            base.push(name);
        }
    }
    base
}

// ─── Exec classification ──────────────────────────────────────────────────────

/// Classify a command into its risk tier.
pub fn classify_command(command: &str, extra_forbidden: &[String]) -> ExecTier {
    let trimmed = command.trim();

    for pattern in extra_forbidden {
        if trimmed.contains(pattern.as_str()) {
            return ExecTier::Forbidden;
        }
    }

    // Destructive globs against protected directories.
    let destructive = Regex::new(
        r"(?x)
        (^|[;&|]\s*) rm \s+ (-[a-zA-Z]+\s+)* (/ | /etc | /usr | /bin | /var | /boot | /home) (/\*)? (\s|$)
    ",
    )
    .expect("static regex");
    if destructive.is_match(trimmed) {
        return ExecTier::Forbidden;
    }

    // Hard blocklist.
    const BLOCKLIST: &[&str] = &[
        "mkfs",
        "dd if=",
        "dd of=/dev/",
        ":(){",
        "shutdown",
        "reboot",
        "init 0",
    ];
    if BLOCKLIST.iter().any(|b| trimmed.contains(b)) {
        return ExecTier::Forbidden;
    }

    // Background execution intent: a trailing `&` that is not `&&`.
    if trimmed.ends_with('&') && !trimmed.ends_with("&&") {
        return ExecTier::Forbidden;
    }

    // Package installs/removals and system service toggles.
    let cautious = Regex::new(
        r"(?x)
        (^|[;&|]\s*) (sudo\s+)?
        ( (apt|apt-get|yum|dnf|pacman|zypper|brew) \s+ (install|remove|purge|upgrade|uninstall)
        | npm \s+ (install|i) \s+ (-g|--global)
        | pip3? \s+ (install|uninstall)
        | cargo \s+ (install|uninstall)
        | gem \s+ install
        | systemctl \s+ (start|stop|restart|enable|disable|mask)
        | service \s+ \S+ \s+ (start|stop|restart)
        )
    ",
    )
    .expect("static regex");
    if cautious.is_match(trimmed) {
        return ExecTier::Cautious;
    }

    ExecTier::Safe
}

/// Extract navigation targets: `cd` arguments and absolute-path targets of
/// mutating commands.  Relative `cd` targets are anchored at the working
/// root.
fn navigation_targets(command: &str, workdir: &Path) -> Vec<PathBuf> {
    const MUTATING: &[&str] = &["rm", "mv", "cp", "tee", "touch", "mkdir", "rmdir", "ln"];
    let mut targets = Vec::new();

    for segment in command.split(&[';', '|'][..]).flat_map(|s| s.split("&&")) {
        let tokens: Vec<&str> = segment.split_whitespace().collect();
        let Some(&first) = tokens.first() else {
            continue;
        };
        if first == "cd" {
            if let Some(dir) = tokens.get(1) {
                let expanded = shellexpand::tilde(dir).into_owned();
                let p = Path::new(&expanded);
                targets.push(if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    workdir.join(p)
                });
            } else if let Some(home) = dirs::home_dir() {
                targets.push(home);
            }
        } else if MUTATING.contains(&first) {
            for t in tokens.iter().skip(1).filter(|t| t.starts_with('/')) {
                targets.push(PathBuf::from(t));
            }
        }
    }
    targets
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
