// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod capture;
mod error;
mod mock;
mod provider;
pub mod sanitize;
mod streaming;
mod types;

pub use error::ModelError;
pub use mock::{MockProvider, ScriptStep, ScriptedMockProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use streaming::ChatClient;
pub use types::{
    CompletionRequest, FunctionCall, Message, MessageContent, ResponseEvent, Role, ToolSchema,
    Usage, MESSAGE_OVERHEAD_TOKENS,
};
