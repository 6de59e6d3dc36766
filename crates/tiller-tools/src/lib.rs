// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
mod cancel;
mod dispatch;
mod parse;
mod registry;
pub mod safety;
mod signature;
mod tool;
mod validate;

pub use cancel::CancelToken;
pub use dispatch::{DispatchOutcome, Dispatcher, TurnCtx};
pub use parse::recover_tool_calls;
pub use registry::{ToolRegistry, ToolSchema};
pub use safety::{
    ApprovalProvider, ApprovalRequest, AutoApprove, AutoDeny, ExecTier, SafetyGate,
};
pub use signature::{canonical_signature, normalize_exec_signature, normalize_regex_pattern};
pub use tool::{
    ErrorCode, StdStream, Tool, ToolCall, ToolCtx, ToolError, ToolOutput, ToolStreamChunk,
};
pub use validate::{ArgSpec, FieldKind, FieldSpec, Validated};
