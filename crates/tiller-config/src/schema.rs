// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named provider endpoints.  Lanes reference these by key.
    ///
    /// ```yaml
    /// providers:
    ///   main:
    ///     base_url: https://api.example.com/v1
    ///     api_key_env: TILLER_API_KEY
    ///     model: large-1
    ///   local:
    ///     base_url: http://localhost:8080/v1
    ///     model: small-3b
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub presenter: PresenterConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl Config {
    /// Root directory for per-session persisted state (captures, vault,
    /// replay checkpoints).  `~/.local/share/tiller` unless overridden.
    pub fn state_dir(&self) -> std::path::PathBuf {
        if let Some(dir) = &self.capture.state_dir {
            return std::path::PathBuf::from(dir);
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tiller")
    }
}

// ─── Providers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Chat completions base URL ending before `/chat/completions`.
    pub base_url: String,
    /// Environment variable holding the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in version-controlled files.
    pub api_key: Option<String>,
    /// Default model for this provider.  A lane without its own model
    /// inherits this one.
    pub model: Option<String>,
    /// Per-provider fallback models, unioned with the lane fallbacks when
    /// composing targets.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    /// Additional `(name, value)` headers sent on every request.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".into(),
            api_key_env: None,
            api_key: None,
            model: None,
            fallback_models: Vec::new(),
            headers: Vec::new(),
            max_tokens: Some(4096),
            temperature: Some(0.2),
        }
    }
}

impl ProviderConfig {
    /// Resolve the effective API key: explicit value wins, then the
    /// configured environment variable.  `None` for unauthenticated local
    /// servers.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// The two model lanes the router selects between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Cheaper / smaller model for routine turns.
    #[default]
    Fast,
    /// Capable / larger model for complex turns.
    Heavy,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Fast => write!(f, "fast"),
            Lane::Heavy => write!(f, "heavy"),
        }
    }
}

/// One keyword/regex classifier rule.  The highest-priority matching rule
/// wins; its `hint` is mapped to a lane through [`RouterConfig::lane_hints`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRule {
    /// Regex matched against the prompt (case-insensitive).
    pub pattern: String,
    /// Hint emitted when the rule matches, e.g. `"quick"` or `"deep"`.
    pub hint: String,
    #[serde(default)]
    pub priority: i32,
    /// Rule applies only when the prompt length is within these bounds.
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
}

fn default_min_dwell() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Provider key (into `Config::providers`) used as the lane primary.
    pub provider: String,
    /// Model override; when absent the provider's model is used.
    pub model: Option<String>,
    /// Lane-level fallback models.
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            provider: "main".into(),
            model: None,
            fallback_models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub fast: LaneConfig,
    #[serde(default)]
    pub heavy: LaneConfig,
    /// Providers tried, in order, after a lane's primary fails with a
    /// transient error.
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    /// Consecutive turns a lane must hold before a non-override switch is
    /// allowed.
    #[serde(default = "default_min_dwell")]
    pub min_dwell: u32,
    #[serde(default)]
    pub rules: Vec<ClassifierRule>,
    /// Maps classifier hints to lanes.  Hints without a mapping fall through
    /// to the heuristic.
    #[serde(default)]
    pub lane_hints: HashMap<String, Lane>,
    /// Prompt length (chars) above which the heuristic prefers the heavy lane.
    #[serde(default = "default_heavy_prompt_chars")]
    pub heavy_prompt_chars: usize,
}

fn default_heavy_prompt_chars() -> usize {
    1200
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fast: LaneConfig::default(),
            heavy: LaneConfig {
                provider: "main".into(),
                model: None,
                fallback_models: Vec::new(),
            },
            fallback_providers: Vec::new(),
            min_dwell: default_min_dwell(),
            rules: Vec::new(),
            lane_hints: HashMap::new(),
            heavy_prompt_chars: default_heavy_prompt_chars(),
        }
    }
}

// ─── Agent ────────────────────────────────────────────────────────────────────

fn default_max_iterations() -> u32 {
    40
}
fn default_ask_timeout_secs() -> u64 {
    1800
}
fn default_context_window() -> usize {
    128_000
}
fn default_compact_at() -> f32 {
    0.85
}
fn default_compact_target() -> f32 {
    0.6
}
fn default_watchdog_timeout_ms() -> u64 {
    90_000
}
fn default_watchdog_max_compactions() -> u32 {
    1
}
fn default_idle_grace_timeouts() -> u32 {
    1
}
fn default_tool_result_token_cap() -> usize {
    4000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model↔tool iterations per ask before failing.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Overall deadline for one ask.
    #[serde(default = "default_ask_timeout_secs")]
    pub ask_timeout_secs: u64,
    /// Context window used for compaction budgeting.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Compact when the token estimate reaches this fraction of the window.
    #[serde(default = "default_compact_at")]
    pub compact_at: f32,
    /// Compaction aims to bring the estimate down to this fraction.
    #[serde(default = "default_compact_target")]
    pub compact_target: f32,
    /// Inter-event silence tolerated before the watchdog acts.
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,
    /// Compactions the watchdog may demand per ask before failing.
    #[serde(default = "default_watchdog_max_compactions")]
    pub watchdog_max_compactions: u32,
    /// Silent-but-not-stuck intervals permitted before the watchdog first acts.
    #[serde(default = "default_idle_grace_timeouts")]
    pub idle_grace_timeouts: u32,
    /// Token cap applied to individual tool results before they enter the
    /// transcript.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            ask_timeout_secs: default_ask_timeout_secs(),
            context_window: default_context_window(),
            compact_at: default_compact_at(),
            compact_target: default_compact_target(),
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            watchdog_max_compactions: default_watchdog_max_compactions(),
            idle_grace_timeouts: default_idle_grace_timeouts(),
            tool_result_token_cap: default_tool_result_token_cap(),
        }
    }
}

// ─── Streaming client ─────────────────────────────────────────────────────────

fn default_response_timeout_secs() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_rate_window_secs() -> u64 {
    60
}
fn default_rate_threshold() -> usize {
    3
}
fn default_backpressure_multiplier() -> f32 {
    2.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Time allowed to the first response byte.  Defaults to the response
    /// timeout when not set explicitly.
    pub connect_timeout_secs: Option<u64>,
    /// Total time allowed for one streamed completion.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    /// Retries on connection failure / HTTP 503 before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Sliding window over which recent 503s are counted.
    #[serde(default = "default_rate_window_secs")]
    pub rate_limit_window_secs: u64,
    /// 503 count within the window after which extra delay is injected.
    #[serde(default = "default_rate_threshold")]
    pub rate_limit_threshold: usize,
    /// A completion slower than `multiplier × rolling average` (≥ 3 samples)
    /// emits a backpressure warning.
    #[serde(default = "default_backpressure_multiplier")]
    pub backpressure_multiplier: f32,
}

impl StreamConfig {
    pub fn effective_connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs
            .unwrap_or(self.response_timeout_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: None,
            response_timeout_secs: default_response_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_window_secs: default_rate_window_secs(),
            rate_limit_threshold: default_rate_threshold(),
            backpressure_multiplier: default_backpressure_multiplier(),
        }
    }
}

// ─── Tool-loop guard ──────────────────────────────────────────────────────────

fn default_history_size() -> usize {
    30
}
fn default_warning_threshold() -> u32 {
    4
}
fn default_critical_threshold() -> u32 {
    8
}
fn default_global_breaker_threshold() -> u32 {
    12
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_capacity() -> usize {
    128
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Ring buffer size for recent tool-call records.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u32,
    /// Breaker fires when the most frequent signature reaches this count.
    #[serde(default = "default_global_breaker_threshold")]
    pub global_breaker_threshold: u32,
    /// TTL for the signature-keyed read-cache layer.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_true")]
    pub detect_generic_repeat: bool,
    #[serde(default = "default_true")]
    pub detect_poll_no_progress: bool,
    #[serde(default = "default_true")]
    pub detect_ping_pong: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            global_breaker_threshold: default_global_breaker_threshold(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            detect_generic_repeat: true,
            detect_poll_no_progress: true,
            detect_ping_pong: true,
        }
    }
}

// ─── Safety ───────────────────────────────────────────────────────────────────

/// Session approval mode.  `yolo` still honors `forbidden` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Refuse every side-effecting call.
    Reject,
    /// Prompt for edits and cautious exec.
    #[default]
    Default,
    /// Allow edits inside the working root without prompting; prompt for
    /// cautious exec and anything outside the root.
    AutoEdit,
    /// No prompts at all.
    Yolo,
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalMode::Reject => write!(f, "reject"),
            ApprovalMode::Default => write!(f, "default"),
            ApprovalMode::AutoEdit => write!(f, "auto-edit"),
            ApprovalMode::Yolo => write!(f, "yolo"),
        }
    }
}

fn default_exec_timeout_code_secs() -> u64 {
    30
}
fn default_exec_timeout_sys_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// Extra allowed root directories in addition to the home directory.
    #[serde(default)]
    pub extra_roots: Vec<String>,
    /// Extra always-forbidden command patterns (simple substring match).
    #[serde(default)]
    pub forbidden_commands: Vec<String>,
    /// Default exec timeout in code mode (overridable per call, 1–120 s).
    #[serde(default = "default_exec_timeout_code_secs")]
    pub exec_timeout_code_secs: u64,
    /// Default exec timeout in sys mode.
    #[serde(default = "default_exec_timeout_sys_secs")]
    pub exec_timeout_sys_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Default,
            extra_roots: Vec::new(),
            forbidden_commands: Vec::new(),
            exec_timeout_code_secs: default_exec_timeout_code_secs(),
            exec_timeout_sys_secs: default_exec_timeout_sys_secs(),
        }
    }
}

// ─── Presenter ────────────────────────────────────────────────────────────────

fn default_progress_interval_ms() -> u64 {
    3000
}
fn default_heartbeat_interval_ms() -> u64 {
    4000
}
fn default_presenter_max_backoff_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenterConfig {
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Ceiling for the edit-retry exponential backoff.
    #[serde(default = "default_presenter_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_backoff_ms: default_presenter_max_backoff_ms(),
        }
    }
}

// ─── Hooks ────────────────────────────────────────────────────────────────────

fn default_hook_warn_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// When true, a handler error fails the current ask; otherwise errors
    /// are logged and swallowed.
    #[serde(default)]
    pub strict: bool,
    /// Handlers slower than this emit a performance warning.
    #[serde(default = "default_hook_warn_ms")]
    pub warn_ms: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            strict: false,
            warn_ms: default_hook_warn_ms(),
        }
    }
}

// ─── Capture ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Append each request/response pair to a JSONL file under the state dir.
    #[serde(default)]
    pub enabled: bool,
    /// State root override; defaults to the platform data dir.
    pub state_dir: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
