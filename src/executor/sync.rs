//! Tree mirroring: Op::Sync
//!
//! Two conflict policies, always applied as separate operations:
//! - [`SyncPolicy::Overwrite`] - files in the tree replace what the target has
//! - [`SyncPolicy::KeepExisting`] - files already on the target are never touched
//!
//! Remote targets use rsync ([`rsync_args`]); targets whose files are visible
//! from this host use [`copy_tree`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::connection::{local, Connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPolicy {
    Overwrite,
    KeepExisting,
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPolicy::Overwrite => write!(f, "overwrite"),
            SyncPolicy::KeepExisting => write!(f, "keep-existing"),
        }
    }
}

/// rsync flags for `policy`. `--itemize-changes` makes the transfer list
/// double as change detection.
///
/// Directory mtimes are not mirrored: home directories on a cabinet are
/// touched by every session and would otherwise show up on every run.
pub fn rsync_args(policy: SyncPolicy) -> Vec<String> {
    let mut args = vec![
        "-a".to_string(),
        "--omit-dir-times".to_string(),
        "--itemize-changes".to_string(),
    ];
    if policy == SyncPolicy::KeepExisting {
        args.push("--ignore-existing".to_string());
    }
    args
}

/// Whether an `--itemize-changes` listing records a real change.
///
/// A directory line whose only difference is its timestamp (`.d..t......`)
/// does not count.
pub fn itemized_changes(listing: &str) -> bool {
    listing.lines().map(str::trim).any(|line| {
        let Some(flags) = line.split_whitespace().next() else {
            return false;
        };
        let is_dir_time_only = flags.starts_with(".d")
            && flags[2..].chars().all(|c| matches!(c, '.' | 't' | 'T' | ' '));
        !is_dir_time_only
    })
}

/// Handle Op::Sync.
pub fn sync_tree(conn: &dyn Connection, src: &Path, dest: &str, policy: SyncPolicy) -> Result<bool> {
    if !src.is_dir() {
        bail!("sync source {} is not a directory", src.display());
    }
    let changed = conn.sync_tree(src, dest, policy)?;
    debug!(host = %conn.name(), src = %src.display(), dest, ?policy, changed, "tree synced");
    Ok(changed)
}

/// Mirror `src` into `dest` on this host. Returns whether anything changed.
///
/// Nothing is ever deleted from `dest`.
pub fn copy_tree(src: &Path, dest: &Path, policy: SyncPolicy) -> Result<bool> {
    if !src.is_dir() {
        bail!("sync source {} is not a directory", src.display());
    }

    let mut changed = false;
    if !dest.is_dir() {
        fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
        changed = true;
    }

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if !target.is_dir() {
                fs::create_dir_all(&target)
                    .with_context(|| format!("creating {}", target.display()))?;
                changed = true;
            }
            continue;
        }

        if policy == SyncPolicy::KeepExisting && target.symlink_metadata().is_ok() {
            continue;
        }

        if file_type.is_symlink() {
            changed |= sync_symlink(entry.path(), &target)?;
        } else {
            changed |= local::copy_if_changed(entry.path(), &target)?;
        }
    }

    Ok(changed)
}

fn sync_symlink(src: &Path, target: &Path) -> Result<bool> {
    let link = fs::read_link(src).with_context(|| format!("reading link {}", src.display()))?;
    if fs::read_link(target).is_ok_and(|existing| existing == link) {
        return Ok(false);
    }
    local::remove_all(target)?;
    std::os::unix::fs::symlink(&link, target)
        .with_context(|| format!("linking {} -> {}", target.display(), link.display()))?;
    Ok(true)
}
