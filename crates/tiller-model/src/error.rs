// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Typed model-side failure.
///
/// The orchestrator uses [`ModelError::is_transient`] to decide whether the
/// same turn may be retried against the next provider target.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// Connection-phase failure (DNS, refused, reset before first byte).
    #[error("connection failed: {0}")]
    Connect(String),
    /// Non-success HTTP status from the chat endpoint.
    #[error("provider error {status}: {body}")]
    Http { status: u16, body: String },
    /// Per-operation deadline exceeded.
    #[error("response timeout after {0:?}")]
    Timeout(Duration),
    /// Mid-stream transport failure after a successful connect.
    #[error("stream error: {0}")]
    Stream(String),
    /// Anything the engine cannot recover from (bad request, auth, parse).
    #[error("{0}")]
    Fatal(String),
}

impl ModelError {
    /// Transient errors may be retried by the streaming client and trigger
    /// provider fallback in the orchestrator: network failures, 503, and
    /// mid-stream transport drops.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Connect(_) | ModelError::Stream(_) => true,
            ModelError::Http { status, .. } => matches!(status, 503 | 502 | 429),
            ModelError::Timeout(_) | ModelError::Fatal(_) => false,
        }
    }

    /// Timeouts are retryable by the caller but are reported as their own
    /// kind, never silently swallowed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModelError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_503_is_transient() {
        let e = ModelError::Http {
            status: 503,
            body: "overloaded".into(),
        };
        assert!(e.is_transient());
    }

    #[test]
    fn http_400_is_not_transient() {
        let e = ModelError::Http {
            status: 400,
            body: "bad request".into(),
        };
        assert!(!e.is_transient());
    }

    #[test]
    fn connect_failure_is_transient() {
        assert!(ModelError::Connect("refused".into()).is_transient());
    }

    #[test]
    fn timeout_is_its_own_kind() {
        let e = ModelError::Timeout(Duration::from_secs(600));
        assert!(e.is_timeout());
        assert!(!e.is_transient());
    }

    #[test]
    fn fatal_is_neither() {
        let e = ModelError::Fatal("invalid schema".into());
        assert!(!e.is_transient());
        assert!(!e.is_timeout());
    }
}
