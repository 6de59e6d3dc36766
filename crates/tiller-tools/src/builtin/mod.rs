// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod apply_patch;
mod edit_range;
mod edit_text;
mod exec;
mod grep;
mod insert_file;
mod list_dir;
mod read_file;
mod read_many;
mod subtask;
mod sys_context;
mod vault_note;
mod vault_search;
mod write_file;

pub use apply_patch::ApplyPatchTool;
pub use edit_range::EditRangeTool;
pub use edit_text::EditTextTool;
pub use exec::{ExecMode, ExecTool};
pub use grep::GrepTool;
pub use insert_file::InsertFileTool;
pub use list_dir::ListDirTool;
pub use read_file::ReadFileTool;
pub use read_many::ReadManyTool;
pub use subtask::{SubtaskRunner, SubtaskSpec, SubtaskTool};
pub use sys_context::SysContextTool;
pub use vault_note::VaultNoteTool;
pub use vault_search::VaultSearchTool;
pub use write_file::WriteFileTool;
