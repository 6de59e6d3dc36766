// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::watch;

/// Cooperative, level-triggered cancellation token.
///
/// Once set the token stays set; every awaiting operation observes it at
/// the next suspension point.  Clones share the same underlying flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation.  Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the token is cancelled.  Resolves immediately when the
    /// token is already set.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for returns immediately when the current value already matches.
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
