//! File operation handlers: Op::WriteFile, Op::CopyFile

use anyhow::{bail, Result};

use crate::connection::Connection;
use crate::process::ExecContext;

/// Handle Op::WriteFile: write `content` unless the file already holds it.
pub fn ensure_file(
    conn: &dyn Connection,
    ctx: &ExecContext,
    path: &str,
    content: &str,
    mode: Option<u32>,
) -> Result<bool> {
    if conn.read_file(ctx, path)?.as_deref() == Some(content) {
        return Ok(false);
    }
    conn.write_file(ctx, path, content, mode)?;
    Ok(true)
}

/// Handle Op::CopyFile: copy within the target unless `to` is identical.
pub fn copy_file(conn: &dyn Connection, ctx: &ExecContext, from: &str, to: &str) -> Result<bool> {
    if !conn.exists(ctx, from)? {
        bail!("file not found on {}: {}", conn.name(), from);
    }
    conn.copy_file(ctx, from, to)
}
