// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session persistent state: the vault (append-only notes surviving
//! context compaction) and the replay store (pre/post images of every file
//! mutation, restorable by checkpoint id).
//!
//! Both stores are opened exclusively by one session; multi-process sharing
//! is out of scope.  All writes are append-only or atomic (tmp + rename).

mod replay;
mod vault;

pub use replay::{atomic_write, Checkpoint, CheckpointId, MutationOp, ReplayStore};
pub use vault::{Vault, VaultEntry};
