// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request/response capture: one JSON object per line, appended to a file
//! under the per-session state directory.
//!
//! Sensitive headers are redacted before the record is built, by walking the
//! known header list (never by open enumeration over arbitrary objects), so
//! a captured record can be shared without leaking credentials.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Usage;

/// Header names whose values are never written to disk (case-insensitive).
const SENSITIVE_HEADERS: &[&str] = &["authorization", "api-key", "x-api-key"];

pub const REDACTED: &str = "[REDACTED]";

/// One captured request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub status: u16,
    /// Request headers after redaction.
    pub headers: Vec<(String, String)>,
    /// The sanitized request body as sent.
    pub request: serde_json::Value,
    /// Accumulated assistant text of the response.
    pub response_text: String,
    pub usage: Option<Usage>,
}

/// Replace the values of sensitive headers with [`REDACTED`].
pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                (name.clone(), REDACTED.to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Appends capture records to a JSONL file, creating parent directories on
/// first use.
#[derive(Debug)]
pub struct CaptureWriter {
    path: PathBuf,
}

impl CaptureWriter {
    /// `captures/<session_id>.jsonl` under the given state root.
    pub fn for_session(state_dir: &Path, session_id: &str) -> Self {
        Self {
            path: state_dir.join("captures").join(format!("{session_id}.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &CaptureRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_headers(headers: Vec<(String, String)>) -> CaptureRecord {
        CaptureRecord {
            timestamp: Utc::now(),
            endpoint: "http://localhost/v1/chat/completions".into(),
            status: 200,
            headers: redact_headers(&headers),
            request: serde_json::json!({ "model": "m" }),
            response_text: "ok".into(),
            usage: None,
        }
    }

    #[test]
    fn authorization_header_redacted_any_case() {
        for name in ["Authorization", "authorization", "AUTHORIZATION"] {
            let out = redact_headers(&[(name.to_string(), "Bearer sk-secret".to_string())]);
            assert_eq!(out[0].1, REDACTED, "{name} should be redacted");
        }
    }

    #[test]
    fn api_key_variants_redacted() {
        let out = redact_headers(&[
            ("api-key".into(), "k1".into()),
            ("X-Api-Key".into(), "k2".into()),
        ]);
        assert_eq!(out[0].1, REDACTED);
        assert_eq!(out[1].1, REDACTED);
    }

    #[test]
    fn benign_headers_kept() {
        let out = redact_headers(&[("Content-Type".into(), "application/json".into())]);
        assert_eq!(out[0].1, "application/json");
    }

    #[test]
    fn captured_line_contains_redacted_not_secret() {
        let dir = tempfile::tempdir().unwrap();
        let w = CaptureWriter::for_session(dir.path(), "s1");
        let rec =
            record_with_headers(vec![("Authorization".into(), "Bearer sk-topsecret".into())]);
        w.append(&rec).unwrap();

        let text = std::fs::read_to_string(w.path()).unwrap();
        assert!(text.contains(REDACTED));
        assert!(!text.contains("sk-topsecret"));
    }

    #[test]
    fn append_produces_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let w = CaptureWriter::for_session(dir.path(), "s2");
        w.append(&record_with_headers(vec![])).unwrap();
        w.append(&record_with_headers(vec![])).unwrap();

        let text = std::fs::read_to_string(w.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["status"], 200);
        }
    }
}
