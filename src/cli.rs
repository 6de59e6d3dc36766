// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Lane override from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LaneArg {
    /// Cheaper/smaller model lane.
    Fast,
    /// Capable/larger model lane.
    Heavy,
}

/// Approval mode from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ApprovalModeArg {
    Reject,
    Default,
    AutoEdit,
    Yolo,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective merged configuration and exit.
    ShowConfig,

    /// List the registered tools and their schemas.
    Tools {
        /// Print full JSON schemas instead of one line per tool.
        #[arg(long)]
        json: bool,
    },

    /// Restore a file to its pre-mutation state by checkpoint id.
    ///
    /// Checkpoint ids are monotonic within a session; `tiller checkpoints`
    /// lists them.
    Rewind {
        /// The session whose checkpoint to restore.
        #[arg(long, short = 's')]
        session: String,
        /// Checkpoint id to rewind to.
        id: u64,
    },

    /// List the replay checkpoints recorded for a session.
    Checkpoints {
        #[arg(long, short = 's')]
        session: String,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = "tiller",
    about = "An interactive AI coding agent turn engine",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// The instruction to run.
    #[arg(value_name = "INSTRUCTION")]
    pub instruction: Option<String>,

    /// Explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Force a model lane for every turn (bypasses the router).
    #[arg(long, value_enum)]
    pub lane: Option<LaneArg>,

    /// Session approval mode.
    #[arg(long, value_enum)]
    pub approval: Option<ApprovalModeArg>,

    /// Capture request/response pairs to the state directory.
    #[arg(long)]
    pub capture: bool,

    /// Verbose tracing to stderr.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
