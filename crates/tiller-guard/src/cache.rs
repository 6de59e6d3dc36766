// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use tiller_config::GuardConfig;

/// Opaque resource version: path, mtime and size of the backing file at the
/// time of caching.  A mismatch on replay evicts the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Probe the current version of `path`.  `None` when the file is not
    /// stat-able (deleted, permission) — such entries never validate.
    pub fn probe(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Some(Self(format!("{}|{}|{}", path.display(), mtime, meta.len())))
    }
}

/// A successful cache replay.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Stored content prefixed with the `[CACHE HIT]` notice and hint.
    pub text: String,
}

#[derive(Debug, Clone)]
struct Entry {
    content: String,
    path: Option<PathBuf>,
    version: Option<ResourceVersion>,
    stored_at: Instant,
}

impl Entry {
    /// An entry is valid when it is within TTL and its backing file (if
    /// any) still has the stored version.
    fn is_valid(&self, ttl: Duration) -> bool {
        if self.stored_at.elapsed() > ttl {
            return false;
        }
        match (&self.path, &self.version) {
            (Some(path), Some(stored)) => ResourceVersion::probe(path).as_ref() == Some(stored),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Two-layer read cache.
///
/// - A signature-keyed LRU layer with TTL — the fast path for exact repeats.
/// - A per-absolute-path layer keyed by `(abs_path | offset | limit)` that
///   also serves non-consecutive reads of the same region.
pub struct ReadCache {
    ttl: Duration,
    by_signature: LruCache<String, Entry>,
    by_path_key: HashMap<String, Entry>,
}

impl ReadCache {
    pub fn new(config: &GuardConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            ttl: Duration::from_secs(config.cache_ttl_secs),
            by_signature: LruCache::new(capacity),
            by_path_key: HashMap::new(),
        }
    }

    pub fn store(
        &mut self,
        _tool: &str,
        signature: &str,
        path: Option<&Path>,
        path_key: Option<String>,
        content: &str,
    ) {
        let entry = Entry {
            content: content.to_string(),
            path: path.map(Path::to_path_buf),
            version: path.and_then(ResourceVersion::probe),
            stored_at: Instant::now(),
        };
        if let Some(key) = path_key {
            self.by_path_key.insert(key, entry.clone());
        }
        self.by_signature.put(signature.to_string(), entry);
    }

    pub fn replay(&mut self, tool: &str, signature: &str, path_key: Option<&str>) -> Option<CacheHit> {
        // Signature layer first, then the path layer for non-consecutive
        // reads that normalize to a different signature.
        let entry = match self.by_signature.get(signature) {
            Some(e) if e.is_valid(self.ttl) => Some(e.clone()),
            Some(_) => {
                self.by_signature.pop(signature);
                None
            }
            None => None,
        };
        let entry = entry.or_else(|| {
            let key = path_key?;
            match self.by_path_key.get(key) {
                Some(e) if e.is_valid(self.ttl) => Some(e.clone()),
                Some(_) => {
                    self.by_path_key.remove(key);
                    None
                }
                None => None,
            }
        })?;

        debug!(tool, signature, "read cache hit");
        Some(CacheHit {
            text: format!(
                "[CACHE HIT] identical read already returned this result. {}\n{}",
                mutation_hint(tool),
                entry.content
            ),
        })
    }

    /// Remove every entry backed by `path`, in both layers.
    pub fn invalidate_path(&mut self, path: &Path) {
        let doomed: Vec<String> = self
            .by_signature
            .iter()
            .filter(|(_, e)| e.path.as_deref() == Some(path))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            self.by_signature.pop(&k);
        }
        self.by_path_key
            .retain(|_, e| e.path.as_deref() != Some(path));
    }
}

/// Parameter-mutation hint appended to cache notices so the model changes
/// something instead of repeating the identical call.
fn mutation_hint(tool: &str) -> &'static str {
    match tool {
        "read_file" | "read_many" => {
            "To see different content, use a larger offset or add a search term."
        }
        "list_dir" => "To see more, try recursive=true, a larger max_entries, or another path.",
        "grep" => "To find different matches, refine the pattern or widen the path.",
        _ => "Change a parameter to get different results.",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
