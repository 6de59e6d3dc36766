// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};

use tiller_config::GuardConfig;

/// Escalation level for a registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopLevel {
    None,
    Warning,
    Critical,
}

/// Which pattern detector fired, when one did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    /// Identical signature back-to-back.
    GenericRepeat,
    /// The same read/search returned the same result several times in a row.
    PollNoProgress,
    /// Two signatures alternating with no mutation in between.
    PingPong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub level: LoopLevel,
    /// Global circuit breaker: the most frequent signature reached the
    /// breaker threshold.
    pub breaker: bool,
    pub detector: Option<DetectorKind>,
}

#[derive(Debug, Clone)]
struct CallRecord {
    signature: String,
    mutating: bool,
    /// Outcome fingerprint, attached by `register_outcome`.
    fingerprint: Option<String>,
}

/// Bounded ring of recent tool-call records plus per-signature counters.
/// Counters track only calls still inside the ring, so old history ages out.
pub struct LoopDetector {
    history_size: usize,
    warning_threshold: u32,
    critical_threshold: u32,
    breaker_threshold: u32,
    detect_generic_repeat: bool,
    detect_poll_no_progress: bool,
    detect_ping_pong: bool,
    ring: VecDeque<CallRecord>,
    counts: HashMap<String, u32>,
}

/// Identical results in a row that count as polling without progress.
const POLL_REPEAT_COUNT: usize = 3;

impl LoopDetector {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            history_size: config.history_size,
            warning_threshold: config.warning_threshold,
            critical_threshold: config.critical_threshold,
            breaker_threshold: config.global_breaker_threshold,
            detect_generic_repeat: config.detect_generic_repeat,
            detect_poll_no_progress: config.detect_poll_no_progress,
            detect_ping_pong: config.detect_ping_pong,
            ring: VecDeque::new(),
            counts: HashMap::new(),
        }
    }

    pub fn register_call(&mut self, signature: &str, mutating: bool) -> Verdict {
        let detector = self.classify(signature, mutating);

        self.ring.push_back(CallRecord {
            signature: signature.to_string(),
            mutating,
            fingerprint: None,
        });
        *self.counts.entry(signature.to_string()).or_insert(0) += 1;
        if self.ring.len() > self.history_size {
            if let Some(old) = self.ring.pop_front() {
                if let Some(n) = self.counts.get_mut(&old.signature) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        self.counts.remove(&old.signature);
                    }
                }
            }
        }

        let count = self.counts.get(signature).copied().unwrap_or(0);
        let level = if count >= self.critical_threshold {
            LoopLevel::Critical
        } else if count >= self.warning_threshold {
            LoopLevel::Warning
        } else {
            LoopLevel::None
        };
        let max_count = self.counts.values().copied().max().unwrap_or(0);
        Verdict {
            level,
            breaker: max_count >= self.breaker_threshold,
            detector,
        }
    }

    /// Attach an outcome fingerprint to the newest record carrying this
    /// signature, feeding the no-progress detector.
    pub fn register_outcome(&mut self, signature: &str, fingerprint: &str) {
        if let Some(rec) = self
            .ring
            .iter_mut()
            .rev()
            .find(|r| r.signature == signature && r.fingerprint.is_none())
        {
            rec.fingerprint = Some(fingerprint.to_string());
        }
    }

    /// Pattern classification for the call about to be registered, based on
    /// the existing ring tail.
    fn classify(&self, signature: &str, _mutating: bool) -> Option<DetectorKind> {
        if self.detect_generic_repeat {
            if let Some(last) = self.ring.back() {
                if last.signature == signature {
                    return Some(DetectorKind::GenericRepeat);
                }
            }
        }

        if self.detect_poll_no_progress {
            let same: Vec<&CallRecord> = self
                .ring
                .iter()
                .rev()
                .take_while(|r| r.signature == signature)
                .collect();
            if same.len() >= POLL_REPEAT_COUNT {
                let prints: Vec<&String> =
                    same.iter().filter_map(|r| r.fingerprint.as_ref()).collect();
                if prints.len() >= POLL_REPEAT_COUNT && prints.windows(2).all(|w| w[0] == w[1]) {
                    return Some(DetectorKind::PollNoProgress);
                }
            }
        }

        if self.detect_ping_pong && self.ring.len() >= 3 {
            // Tail ...B A B plus incoming A, with no mutation among them.
            let tail: Vec<&CallRecord> = self.ring.iter().rev().take(3).collect();
            let (b1, a1, b2) = (tail[0], tail[1], tail[2]);
            if a1.signature == signature
                && b1.signature == b2.signature
                && b1.signature != signature
                && !b1.mutating
                && !a1.mutating
                && !b2.mutating
            {
                return Some(DetectorKind::PingPong);
            }
        }

        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
