// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Monotonic checkpoint identifier within one session.
pub type CheckpointId = u64;

/// The mutation kinds that trigger a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Write,
    EditText,
    EditRange,
    Insert,
    Patch,
}

/// Metadata for one captured pre/post-image pair.  The image bytes live in
/// sibling files `<id>.pre` / `<id>.post`; a missing `.pre` file means the
/// target did not exist before the mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub op: MutationOp,
    pub path: PathBuf,
    pub note: Option<String>,
    /// Whether the file existed (and a pre-image was captured).
    pub had_pre_image: bool,
    pub completed: bool,
}

/// Write `bytes` to `path` atomically: write to a temp file in the same
/// directory, then rename over the target.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into()),
        std::process::id()
    ));
    {
        let mut f = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} → {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Checkpoint store for one session.  Ids are monotonic; checkpoints are
/// immutable once completed.
pub struct ReplayStore {
    dir: PathBuf,
    next_id: CheckpointId,
    checkpoints: Vec<Checkpoint>,
}

impl ReplayStore {
    pub fn open(state_dir: &Path, session_id: &str) -> anyhow::Result<Self> {
        let dir = state_dir.join("replay").join(session_id);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let index = dir.join("index.jsonl");
        let mut checkpoints: Vec<Checkpoint> = Vec::new();
        if index.is_file() {
            for line in std::fs::read_to_string(&index)?
                .lines()
                .filter(|l| !l.trim().is_empty())
            {
                match serde_json::from_str::<Checkpoint>(line) {
                    // The index is append-only: completion re-appends the
                    // record, so the last line per id wins.
                    Ok(cp) => match checkpoints.iter_mut().find(|c| c.id == cp.id) {
                        Some(existing) => *existing = cp,
                        None => checkpoints.push(cp),
                    },
                    Err(e) => debug!("skipping corrupt checkpoint line: {e}"),
                }
            }
        }
        let next_id = checkpoints.iter().map(|c| c.id + 1).max().unwrap_or(0);
        Ok(Self {
            dir,
            next_id,
            checkpoints,
        })
    }

    fn image_path(&self, id: CheckpointId, suffix: &str) -> PathBuf {
        self.dir.join(format!("{id}.{suffix}"))
    }

    fn append_index(&self, cp: &Checkpoint) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("index.jsonl"))?;
        writeln!(file, "{}", serde_json::to_string(cp)?)?;
        Ok(())
    }

    /// Capture the pre-image of `path` before a mutation.  Returns the new
    /// checkpoint id; attach the post-image with [`Self::complete`].
    pub fn begin(
        &mut self,
        op: MutationOp,
        path: &Path,
        note: Option<String>,
    ) -> anyhow::Result<CheckpointId> {
        let id = self.next_id;
        self.next_id += 1;

        let had_pre_image = path.is_file();
        if had_pre_image {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading pre-image of {}", path.display()))?;
            atomic_write(&self.image_path(id, "pre"), &bytes)?;
        }

        let cp = Checkpoint {
            id,
            op,
            path: path.to_path_buf(),
            note,
            had_pre_image,
            completed: false,
        };
        self.append_index(&cp)?;
        self.checkpoints.push(cp);
        debug!(id, path = %path.display(), "checkpoint captured");
        Ok(id)
    }

    /// Attach the post-image after the mutation ran.
    pub fn complete(&mut self, id: CheckpointId) -> anyhow::Result<()> {
        let cp = self
            .checkpoints
            .iter_mut()
            .find(|c| c.id == id)
            .with_context(|| format!("unknown checkpoint {id}"))?;
        if cp.path.is_file() {
            let bytes = std::fs::read(&cp.path)?;
            atomic_write(&self.dir.join(format!("{id}.post")), &bytes)?;
        }
        cp.completed = true;
        let updated = cp.clone();
        self.append_index(&updated)?;
        Ok(())
    }

    /// Restore the pre-image of checkpoint `id` using the atomic write
    /// primitive.  A checkpoint whose target did not exist removes the file.
    pub fn rewind(&self, id: CheckpointId) -> anyhow::Result<()> {
        let cp = self
            .checkpoints
            .iter()
            .find(|c| c.id == id)
            .with_context(|| format!("unknown checkpoint {id}"))?;
        if cp.had_pre_image {
            let bytes = std::fs::read(self.image_path(id, "pre"))
                .with_context(|| format!("reading stored pre-image for checkpoint {id}"))?;
            atomic_write(&cp.path, &bytes)?;
        } else if cp.path.is_file() {
            std::fs::remove_file(&cp.path)
                .with_context(|| format!("removing {}", cp.path.display()))?;
        }
        debug!(id, path = %cp.path.display(), "rewound to checkpoint");
        Ok(())
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
