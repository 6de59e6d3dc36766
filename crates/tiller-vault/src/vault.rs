// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One immutable vault entry.  Superseded entries are kept for history;
/// the latest entry per key wins on plain lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaultEntry {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    /// Free-form entry kind, e.g. `"note"`, `"decision"`, `"todo"`.
    pub kind: String,
}

/// Append-only note store with a secondary latest-by-key index.
pub struct Vault {
    log_path: PathBuf,
    entries: Vec<VaultEntry>,
    /// key → index into `entries` of the newest entry for that key.
    latest: HashMap<String, usize>,
}

impl Vault {
    /// Open (or create) the vault log for one session under the state root.
    pub fn open(state_dir: &Path, session_id: &str) -> anyhow::Result<Self> {
        let log_path = state_dir.join("vault").join(format!("{session_id}.jsonl"));
        let mut vault = Self {
            log_path,
            entries: Vec::new(),
            latest: HashMap::new(),
        };
        if vault.log_path.is_file() {
            let text = std::fs::read_to_string(&vault.log_path)
                .with_context(|| format!("reading {}", vault.log_path.display()))?;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<VaultEntry>(line) {
                    Ok(entry) => vault.index(entry),
                    Err(e) => debug!("skipping corrupt vault line: {e}"),
                }
            }
        }
        Ok(vault)
    }

    /// In-memory vault for tests and ephemeral sessions.
    pub fn in_memory() -> Self {
        Self {
            log_path: PathBuf::new(),
            entries: Vec::new(),
            latest: HashMap::new(),
        }
    }

    fn index(&mut self, entry: VaultEntry) {
        self.latest.insert(entry.key.clone(), self.entries.len());
        self.entries.push(entry);
    }

    /// Append a new entry.  An existing key is superseded, never mutated.
    pub fn note(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        kind: impl Into<String>,
    ) -> anyhow::Result<&VaultEntry> {
        let entry = VaultEntry {
            key: key.into(),
            value: value.into(),
            updated_at: Utc::now(),
            kind: kind.into(),
        };
        if !self.log_path.as_os_str().is_empty() {
            if let Some(parent) = self.log_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .with_context(|| format!("opening {}", self.log_path.display()))?;
            writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        }
        self.index(entry);
        Ok(self.entries.last().expect("entry just pushed"))
    }

    /// Latest entry for `key`.
    pub fn lookup(&self, key: &str) -> Option<&VaultEntry> {
        self.latest.get(key).map(|&i| &self.entries[i])
    }

    /// Specific version of `key`, counted from the oldest entry (version 0).
    pub fn lookup_version(&self, key: &str, version: usize) -> Option<&VaultEntry> {
        self.entries.iter().filter(|e| e.key == key).nth(version)
    }

    /// Number of recorded versions of `key`.
    pub fn version_count(&self, key: &str) -> usize {
        self.entries.iter().filter(|e| e.key == key).count()
    }

    /// Substring search over entry values, newest first, capped at `limit`.
    /// Only the latest entry per key is considered.
    pub fn search(&self, query: &str, limit: usize) -> Vec<&VaultEntry> {
        let query = query.to_lowercase();
        let mut hits: Vec<&VaultEntry> = self
            .latest
            .values()
            .map(|&i| &self.entries[i])
            .filter(|e| {
                e.value.to_lowercase().contains(&query) || e.key.to_lowercase().contains(&query)
            })
            .collect();
        hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        hits.truncate(limit);
        hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_then_lookup_returns_latest() {
        let mut v = Vault::in_memory();
        v.note("plan", "step one", "note").unwrap();
        v.note("plan", "step two", "note").unwrap();
        assert_eq!(v.lookup("plan").unwrap().value, "step two");
    }

    #[test]
    fn superseded_entries_are_kept_for_history() {
        let mut v = Vault::in_memory();
        v.note("k", "v1", "note").unwrap();
        v.note("k", "v2", "note").unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v.version_count("k"), 2);
        assert_eq!(v.lookup_version("k", 0).unwrap().value, "v1");
        assert_eq!(v.lookup_version("k", 1).unwrap().value, "v2");
    }

    #[test]
    fn lookup_unknown_key_is_none() {
        let v = Vault::in_memory();
        assert!(v.lookup("nope").is_none());
    }

    #[test]
    fn search_matches_substring_case_insensitive() {
        let mut v = Vault::in_memory();
        v.note("a", "the Database schema uses UUIDs", "note").unwrap();
        v.note("b", "unrelated", "note").unwrap();
        let hits = v.search("database", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "a");
    }

    #[test]
    fn search_respects_limit() {
        let mut v = Vault::in_memory();
        for i in 0..10 {
            v.note(format!("k{i}"), "common text", "note").unwrap();
        }
        assert_eq!(v.search("common", 3).len(), 3);
    }

    #[test]
    fn search_considers_only_latest_per_key() {
        let mut v = Vault::in_memory();
        v.note("k", "old needle", "note").unwrap();
        v.note("k", "fresh value", "note").unwrap();
        assert!(v.search("needle", 10).is_empty());
        assert_eq!(v.search("fresh", 10).len(), 1);
    }

    #[test]
    fn entries_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut v = Vault::open(dir.path(), "s1").unwrap();
            v.note("k", "persisted", "note").unwrap();
        }
        let v = Vault::open(dir.path(), "s1").unwrap();
        assert_eq!(v.lookup("k").unwrap().value, "persisted");
    }

    #[test]
    fn sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut v = Vault::open(dir.path(), "s1").unwrap();
            v.note("k", "one", "note").unwrap();
        }
        let v2 = Vault::open(dir.path(), "s2").unwrap();
        assert!(v2.lookup("k").is_none());
    }
}
