// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-loop guard: three cooperating responsibilities under one component.
//!
//! 1. Short-circuit repeated reads through a versioned cache
//!    ([`cache::ReadCache`]).
//! 2. Detect runaway identical calls and surface warnings
//!    ([`detector::LoopDetector`]).
//! 3. Book-keep per-turn dedup and expose telemetry counters.
//!
//! The guard owns its caches and records; tool handlers interact only
//! through the narrow API here and receive copies, never internal pointers.

mod cache;
mod detector;

use std::path::Path;

pub use cache::{CacheHit, ReadCache, ResourceVersion};
pub use detector::{DetectorKind, LoopDetector, LoopLevel, Verdict};

use tiller_config::GuardConfig;

/// Telemetry counters exposed via [`ToolLoopGuard::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub calls_registered: u64,
    pub deduped_replays: u64,
    pub read_cache_lookups: u64,
    pub read_cache_hits: u64,
    pub warnings: u64,
    pub criticals: u64,
    pub recovery_recommended: u64,
    /// Consecutive read-file failures; reset on the next successful read.
    pub read_file_failures: u32,
}

pub struct ToolLoopGuard {
    cache: ReadCache,
    detector: LoopDetector,
    stats: GuardStats,
    disable_tools_next_turn: bool,
}

impl ToolLoopGuard {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            cache: ReadCache::new(config),
            detector: LoopDetector::new(config),
            stats: GuardStats::default(),
            disable_tools_next_turn: false,
        }
    }

    /// Register an attempted call before execution.  The returned verdict
    /// drives loop warnings; a `critical` verdict disables tools for the
    /// next turn only.
    pub fn register_call(&mut self, signature: &str, mutating: bool) -> Verdict {
        self.stats.calls_registered += 1;
        let verdict = self.detector.register_call(signature, mutating);
        match verdict.level {
            LoopLevel::Warning => self.stats.warnings += 1,
            LoopLevel::Critical => {
                self.stats.criticals += 1;
                self.disable_tools_next_turn = true;
            }
            LoopLevel::None => {}
        }
        if verdict.breaker {
            self.stats.recovery_recommended += 1;
        }
        verdict
    }

    /// Record the outcome of a completed call (feeds the no-progress
    /// detector and the consecutive-read-failure counter).
    pub fn register_outcome(&mut self, signature: &str, fingerprint: &str, is_error: bool) {
        self.detector.register_outcome(signature, fingerprint);
        if is_error {
            self.stats.read_file_failures += 1;
        } else {
            self.stats.read_file_failures = 0;
        }
    }

    pub fn note_replay(&mut self) {
        self.stats.deduped_replays += 1;
    }

    /// Look up a cached read result.  Hits come back with a `[CACHE HIT]`
    /// prefix and a parameter-mutation hint so the model breaks the loop.
    pub fn read_cache_replay(
        &mut self,
        tool: &str,
        signature: &str,
        path_key: Option<&str>,
    ) -> Option<CacheHit> {
        self.stats.read_cache_lookups += 1;
        let hit = self.cache.replay(tool, signature, path_key);
        if hit.is_some() {
            self.stats.read_cache_hits += 1;
        }
        hit
    }

    /// Store a read result for future replay.  Only read-only tools are
    /// cached; the dispatcher enforces that.
    pub fn store_read_cache(
        &mut self,
        tool: &str,
        signature: &str,
        path: Option<&Path>,
        path_key: Option<String>,
        content: &str,
    ) {
        self.cache.store(tool, signature, path, path_key, content);
    }

    /// Drop every cache entry touching `path`.  Called by the dispatcher
    /// before any mutating tool runs.
    pub fn invalidate_file_content_cache(&mut self, path: &Path) {
        self.cache.invalidate_path(path);
    }

    /// True exactly once after a critical verdict; reading resets the flag
    /// so tools are disabled for the next turn only.
    pub fn should_disable_tools_next_turn(&mut self) -> bool {
        std::mem::take(&mut self.disable_tools_next_turn)
    }

    pub fn stats(&self) -> GuardStats {
        self.stats
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ToolLoopGuard {
        ToolLoopGuard::new(&GuardConfig::default())
    }

    #[test]
    fn stats_count_registrations() {
        let mut g = guard();
        g.register_call("sig-a", false);
        g.register_call("sig-b", false);
        assert_eq!(g.stats().calls_registered, 2);
    }

    // Invariant: with thresholds (w=4, c=8, g=12) the first critical appears
    // at the 8th identical call and the global breaker at the 12th.
    #[test]
    fn loop_detector_monotonicity() {
        let mut g = guard();
        let mut first_warning = None;
        let mut first_critical = None;
        let mut first_breaker = None;
        for i in 1..=12u32 {
            let v = g.register_call("same", false);
            if first_warning.is_none() && v.level == LoopLevel::Warning {
                first_warning = Some(i);
            }
            if first_critical.is_none() && v.level == LoopLevel::Critical {
                first_critical = Some(i);
            }
            if first_breaker.is_none() && v.breaker {
                first_breaker = Some(i);
            }
        }
        assert_eq!(first_warning, Some(4));
        assert_eq!(first_critical, Some(8));
        assert_eq!(first_breaker, Some(12));
    }

    #[test]
    fn critical_disables_tools_for_next_turn_only() {
        let mut g = guard();
        for _ in 0..8 {
            g.register_call("same", false);
        }
        assert!(g.should_disable_tools_next_turn());
        assert!(!g.should_disable_tools_next_turn(), "flag resets after read");
    }

    #[test]
    fn read_failures_reset_on_success() {
        let mut g = guard();
        g.register_outcome("s", "err", true);
        g.register_outcome("s", "err", true);
        assert_eq!(g.stats().read_file_failures, 2);
        g.register_outcome("s", "ok", false);
        assert_eq!(g.stats().read_file_failures, 0);
    }

    #[test]
    fn cache_round_trip_and_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "content").unwrap();

        let mut g = guard();
        let key = format!("{}|1|200", file.display());
        g.store_read_cache("read_file", "sig-1", Some(&file), Some(key.clone()), "content");

        let hit = g
            .read_cache_replay("read_file", "sig-1", Some(key.as_str()))
            .unwrap();
        assert!(hit.text.starts_with("[CACHE HIT]"), "{}", hit.text);
        assert!(hit.text.contains("content"));

        g.invalidate_file_content_cache(&file);
        assert!(g
            .read_cache_replay("read_file", "sig-1", Some(key.as_str()))
            .is_none());
    }

    #[test]
    fn lookup_and_hit_counters_advance() {
        let mut g = guard();
        g.store_read_cache("read_file", "s", None, None, "x");
        let _ = g.read_cache_replay("read_file", "s", None);
        let _ = g.read_cache_replay("read_file", "missing", None);
        let s = g.stats();
        assert_eq!(s.read_cache_lookups, 2);
        assert_eq!(s.read_cache_hits, 1);
    }
}
