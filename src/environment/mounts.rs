//! Host filesystems bound into the chroot.
//!
//! Mount order is the configured order; unmount order is its exact reverse
//! with deeper paths always first, so `dev/pts` leaves before `dev`.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::connection::Connection;
use crate::error::ProvisionError;
use crate::process::{Cmd, ExecContext};

/// Host filesystems a Raspberry Pi OS chroot needs, in mount order.
pub const DEFAULT_MOUNTS: &[&str] = &["proc", "sys", "dev", "dev/pts"];

/// Where the kernel lists what is mounted.
pub const MOUNT_TABLE: &str = "/proc/self/mounts";

/// One host path bound onto the same path inside the chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Path relative to both roots, e.g. `dev/pts`.
    pub relative: String,
    /// Host path, e.g. `/dev/pts`.
    pub source: String,
    /// Mount point under the chroot, e.g. `/srv/pi/dev/pts`.
    pub target: String,
}

impl BindMount {
    fn depth(&self) -> usize {
        self.relative.split('/').filter(|part| !part.is_empty()).count()
    }
}

/// Ordered set of bind mounts for one chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSet {
    root: PathBuf,
    mounts: Vec<BindMount>,
}

impl MountSet {
    pub fn new(root: &Path, relative: &[String]) -> Self {
        let mounts = relative
            .iter()
            .map(|rel| rel.trim_matches('/'))
            .filter(|rel| !rel.is_empty())
            .map(|rel| BindMount {
                relative: rel.to_string(),
                source: format!("/{}", rel),
                target: root.join(rel).to_string_lossy().into_owned(),
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            mounts,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mount_order(&self) -> Vec<BindMount> {
        self.mounts.clone()
    }

    /// Reverse of [`mount_order`](Self::mount_order), deepest paths first.
    pub fn unmount_order(&self) -> Vec<BindMount> {
        let mut order: Vec<BindMount> = self.mounts.iter().rev().cloned().collect();
        // stable: equal depths keep reverse creation order
        order.sort_by_key(|mount| std::cmp::Reverse(mount.depth()));
        order
    }
}

/// `mountpoint -q`: exit 0 means mounted. Never fails on a non-zero exit.
pub fn is_mounted(host: &dyn Connection, ctx: &ExecContext, target: &str) -> Result<bool> {
    let out = host.exec(
        &Cmd::new("mountpoint")
            .args(["-q", target])
            .with_context(ctx)
            .allow_fail(),
    )?;
    Ok(out.success())
}

/// Bind `mount.source` onto its target unless it is mounted already.
///
/// A missing mount point is a precondition failure: the extracted image is
/// not a usable root filesystem.
pub fn bind(host: &dyn Connection, ctx: &ExecContext, mount: &BindMount) -> Result<bool> {
    if !host.is_dir(ctx, &mount.target)? {
        return Err(ProvisionError::precondition(format!(
            "mount point {} does not exist",
            mount.target
        ))
        .into());
    }
    if is_mounted(host, ctx, &mount.target)? {
        return Ok(false);
    }
    host.exec(
        &Cmd::new("mount")
            .args(["--bind", mount.source.as_str(), mount.target.as_str()])
            .with_context(ctx)
            .error_msg(format!("binding {} to {}", mount.source, mount.target)),
    )?;
    Ok(true)
}

/// Unmount `target` if the probe says it is mounted.
pub fn unmount(host: &dyn Connection, ctx: &ExecContext, target: &str) -> Result<bool> {
    if !is_mounted(host, ctx, target)? {
        return Ok(false);
    }
    host.exec(
        &Cmd::new("umount")
            .arg(target)
            .with_context(ctx)
            .error_msg(format!("unmounting {}", target)),
    )?;
    Ok(true)
}

/// Mount points in a `/proc/self/mounts` style table at or below `dir`,
/// deepest first.
pub fn mounted_under(table: &str, dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .filter(|path| path.starts_with(dir))
        .collect();
    found.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    found.dedup();
    found
}

/// Mount points under `dir` according to the host's mount table.
pub fn live_mounts_under(host: &dyn Connection, ctx: &ExecContext, dir: &Path) -> Result<Vec<PathBuf>> {
    let table = host.read_file(ctx, MOUNT_TABLE)?.unwrap_or_default();
    Ok(mounted_under(&table, dir))
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let digits = field.get(i + 1..i + 4).filter(|d| d.bytes().all(|b| (b'0'..=b'7').contains(&b)));
            if let Some(value) = digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
