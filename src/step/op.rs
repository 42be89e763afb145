//! Declarative operations.
//!
//! An [`Op`] says WHAT state a target should be in; the
//! [`executor`](crate::executor) decides HOW to get there and reports whether
//! anything changed. Every variant is idempotent: applying it to a target
//! already in the desired state is a no-op.

use std::path::PathBuf;

use crate::executor::sync::SyncPolicy;
use crate::process::Cmd;

#[derive(Debug, Clone)]
pub enum Op {
    // ─────────────────────────────────────────────────────────────────────
    // Files and directories
    // ─────────────────────────────────────────────────────────────────────
    /// Create directories that are missing.
    Dirs(Vec<String>),

    /// Write a file unless it already holds exactly this content.
    WriteFile {
        path: String,
        content: String,
        mode: Option<u32>,
    },

    /// Copy a file within the target unless the destination is identical.
    CopyFile { from: String, to: String },

    /// Move a legacy path into its new location, once.
    Migrate { from: String, to: String },

    /// Mirror a local tree into the target.
    Sync {
        src: PathBuf,
        dest: String,
        policy: SyncPolicy,
    },

    // ─────────────────────────────────────────────────────────────────────
    // In-place edits
    // ─────────────────────────────────────────────────────────────────────
    /// Replace the last line matching `regexp` with `line`, or append it.
    /// Creates the file when missing.
    LineInFile {
        path: String,
        regexp: String,
        line: String,
    },

    /// Rewrite the value of every line starting with `key`, keeping the key
    /// token and its separator; append `key<separator>value` if none does.
    KeyValue {
        path: String,
        key: String,
        value: String,
        separator: String,
    },

    /// Ensure kernel command-line parameters (`name=value` or bare flags)
    /// in a single-line file.
    CmdlineParams { path: String, params: Vec<String> },

    /// Comment out every active line of a file.
    CommentOut(String),

    // ─────────────────────────────────────────────────────────────────────
    // System state
    // ─────────────────────────────────────────────────────────────────────
    /// Install missing packages from `present`, purge installed ones from
    /// `absent`. Duplicates are allowed.
    Packages {
        present: Vec<String>,
        absent: Vec<String>,
    },

    /// Enable systemd units that are not enabled yet.
    EnableServices(Vec<String>),

    /// Run a command. Always reports a change; guard it.
    Command(Cmd),
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable step lists
// ─────────────────────────────────────────────────────────────────────────────

/// Create directories.
pub fn dirs(paths: impl IntoIterator<Item = impl Into<String>>) -> Op {
    Op::Dirs(paths.into_iter().map(Into::into).collect())
}

/// Write a file.
pub fn write_file(path: impl Into<String>, content: impl Into<String>) -> Op {
    Op::WriteFile {
        path: path.into(),
        content: content.into(),
        mode: None,
    }
}

/// Write a file with permissions.
pub fn write_file_mode(path: impl Into<String>, content: impl Into<String>, mode: u32) -> Op {
    Op::WriteFile {
        path: path.into(),
        content: content.into(),
        mode: Some(mode),
    }
}

/// Replace-or-append a line.
pub fn line_in_file(
    path: impl Into<String>,
    regexp: impl Into<String>,
    line: impl Into<String>,
) -> Op {
    Op::LineInFile {
        path: path.into(),
        regexp: regexp.into(),
        line: line.into(),
    }
}

/// Upsert a whitespace-separated `key value` line.
pub fn key_value(path: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Op {
    Op::KeyValue {
        path: path.into(),
        key: key.into(),
        value: value.into(),
        separator: "    ".into(),
    }
}

/// Upsert a `key=value` line.
pub fn key_equals(path: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Op {
    Op::KeyValue {
        path: path.into(),
        key: key.into(),
        value: value.into(),
        separator: "=".into(),
    }
}

/// Run a command.
pub fn command(cmd: Cmd) -> Op {
    Op::Command(cmd)
}
