//! Op executor - interprets [`Op`] variants against a [`Connection`].
//!
//! Every handler inspects the target first and only acts on a difference, so
//! it can report whether anything changed:
//!
//! - [`directories`] - scaffolding and one-time migrations
//! - [`files`] - whole-file writes and in-target copies
//! - [`edit`] - line, key and kernel command-line patches
//! - [`packages`] - apt package delta
//! - [`services`] - systemd unit enablement
//! - [`sync`] - tree mirroring with a conflict policy
//!
//! # Example
//!
//! ```rust,ignore
//! use arcade_provision::executor;
//! use arcade_provision::step::op;
//!
//! let change = executor::execute(&conn, &ctx, &op::key_value(
//!     "/home/pi/.attract/attract.cfg",
//!     "window_mode",
//!     "fullscreen",
//! ))?;
//! ```

pub mod directories;
pub mod edit;
pub mod files;
pub mod packages;
pub mod services;
pub mod sync;

use anyhow::Result;

use crate::connection::Connection;
use crate::process::ExecContext;
use crate::step::{Change, Op};

/// Bring the target to the state `op` describes.
pub fn execute(conn: &dyn Connection, ctx: &ExecContext, op: &Op) -> Result<Change> {
    let changed = match op {
        Op::Dirs(paths) => directories::ensure_dirs(conn, ctx, paths)?,
        Op::WriteFile {
            path,
            content,
            mode,
        } => files::ensure_file(conn, ctx, path, content, *mode)?,
        Op::CopyFile { from, to } => files::copy_file(conn, ctx, from, to)?,
        Op::Migrate { from, to } => directories::migrate(conn, ctx, from, to)?,
        Op::Sync { src, dest, policy } => sync::sync_tree(conn, src, dest, *policy)?,

        Op::LineInFile { path, regexp, line } => {
            edit::apply_line_in_file(conn, ctx, path, regexp, line)?
        }
        Op::KeyValue {
            path,
            key,
            value,
            separator,
        } => edit::apply_key_value(conn, ctx, path, key, value, separator)?,
        Op::CmdlineParams { path, params } => edit::apply_cmdline_params(conn, ctx, path, params)?,
        Op::CommentOut(path) => edit::apply_comment_out(conn, ctx, path)?,

        Op::Packages { present, absent } => packages::ensure(conn, ctx, present, absent)?,
        Op::EnableServices(units) => services::enable(conn, ctx, units)?,
        Op::Command(cmd) => {
            conn.exec(&cmd.clone().with_context(ctx))?;
            true
        }
    };
    Ok(Change::from_bool(changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use crate::process::Cmd;
    use crate::step::op;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_execute_write_file_reports_change_once() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path());
        let op = op::write_file("/etc/hostname", "arcade1\n");

        assert_eq!(execute(&conn, &ExecContext::new(), &op).unwrap(), Change::Changed);
        assert_eq!(execute(&conn, &ExecContext::new(), &op).unwrap(), Change::Unchanged);
        assert_eq!(
            fs::read_to_string(temp.path().join("etc/hostname")).unwrap(),
            "arcade1\n"
        );
    }

    #[test]
    fn test_execute_command_applies_context() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path());
        let ctx = ExecContext::as_user("pi").workdir("/home/pi/src/attract");

        let change = execute(&conn, &ctx, &op::command(Cmd::new("make").arg("-j4"))).unwrap();

        assert_eq!(change, Change::Changed);
        assert_eq!(conn.commands(), vec!["make -j4"]);
    }

    #[test]
    fn test_execute_key_value_on_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path());
        let op = op::key_value("/home/pi/.attract/attract.cfg", "window_mode", "fullscreen");

        assert!(execute(&conn, &ExecContext::new(), &op).is_err());
    }
}
