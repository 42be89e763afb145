//! Idempotency signals for component builds.
//!
//! - The build stamp is a SHA-256 over everything that affects a build's
//!   output: revision, arch flags and arguments. A matching stamp in the
//!   source directory means configure/build/install have nothing to do.
//! - A [`Snapshot`] records a generated file before configure so an
//!   identical regeneration does not bump its mtime and trigger rebuilds.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::time::SystemTime;

use super::{BuildConfig, ComponentSpec};
use crate::connection::Connection;
use crate::process::ExecContext;

/// Written into each component's source directory after a successful install.
pub const STAMP_FILE: &str = ".arcade-provision-stamp";

pub fn stamp_path(config: &BuildConfig, spec: &ComponentSpec) -> String {
    format!("{}/{}", config.source_dir(spec), STAMP_FILE)
}

/// Hex SHA-256 identifying one build of `spec` at `revision`.
pub fn compute(revision: &str, config: &BuildConfig, spec: &ComponentSpec) -> String {
    let mut hasher = Sha256::new();
    let mut field = |value: &str| {
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    };

    field(revision);
    field(&config.arch_flags);
    field(&spec.system.to_string());
    for (section, args) in [
        ("configure", &spec.configure_args),
        ("make", &spec.make_args),
    ] {
        field(section);
        for arg in args {
            field(&config.expand(arg));
        }
    }
    if let Some(argv) = &spec.install_command {
        field("install");
        for arg in argv {
            field(arg);
        }
    }

    format!("{:x}", hasher.finalize())
}

/// Whether the stamp on the target differs from `expected` (or is missing).
pub fn is_stale(
    conn: &dyn Connection,
    ctx: &ExecContext,
    path: &str,
    expected: &str,
) -> Result<bool> {
    let recorded = conn.read_file(ctx, path)?;
    Ok(recorded.as_deref().map(str::trim) != Some(expected))
}

/// A generated file's mtime and content hash before configure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub mtime: SystemTime,
    pub sha256: String,
}

impl Snapshot {
    /// `None` when the file does not exist yet.
    pub fn take(conn: &dyn Connection, ctx: &ExecContext, path: &str) -> Result<Option<Self>> {
        let (Some(mtime), Some(sha256)) = (conn.mtime(ctx, path)?, conn.sha256(ctx, path)?) else {
            return Ok(None);
        };
        Ok(Some(Self { mtime, sha256 }))
    }

    /// Put the old mtime back if the file still has the snapshot's content.
    ///
    /// Returns whether the mtime was restored.
    pub fn restore_if_identical(
        &self,
        conn: &dyn Connection,
        ctx: &ExecContext,
        path: &str,
    ) -> Result<bool> {
        if conn.sha256(ctx, path)?.as_deref() != Some(self.sha256.as_str()) {
            return Ok(false);
        }
        if conn.mtime(ctx, path)? == Some(self.mtime) {
            return Ok(false);
        }
        conn.set_mtime(ctx, path, self.mtime)?;
        Ok(true)
    }
}
