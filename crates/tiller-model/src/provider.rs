// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, ModelError, ResponseEvent};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseEvent, ModelError>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider name for routing, logging and hook payloads.
    fn name(&self) -> &str;

    /// Model identifier as reported to users and hook payloads.
    fn model_name(&self) -> &str;

    /// Endpoint description for hook payloads (URL or `"mock"`).
    fn endpoint(&self) -> &str {
        "mock"
    }

    /// Send a completion request and return a streaming response.
    ///
    /// Connection-phase retries (backoff, 503 rate limiting) happen inside
    /// the provider; a returned error is final for this target and the
    /// orchestrator decides whether to fall back to another target.
    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError>;
}
