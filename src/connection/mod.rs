//! Provisioning targets.
//!
//! A [`Connection`] runs commands and touches files on one target:
//!
//! - [`LocalConnection`] - this host
//! - [`ChrootConnection`] - the prepared chroot, entered through the emulator shim
//! - [`SshConnection`] - a cabinet reached over SSH
//!
//! File operations have two implementations. Targets whose filesystem is
//! visible from this host (see [`Connection::local_root`]) use direct
//! filesystem calls under that root; everything else goes through small shell
//! commands run with [`Connection::exec`].

pub mod chroot;
#[cfg(test)]
pub(crate) mod fake;
pub mod local;
pub mod ssh;

pub use chroot::ChrootConnection;
pub use local::LocalConnection;
pub use ssh::SshConnection;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::executor::sync::SyncPolicy;
use crate::process::{Cmd, CmdOutput, ExecContext};

/// One target a phase runs against.
///
/// Paths are absolute paths as seen from inside the target.
pub trait Connection {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Identity commands run as unless a step asks for another one.
    fn login_user(&self) -> &str;

    /// Run a command on the target, applying the command's exit status policy.
    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput>;

    /// Host directory that maps to the target's `/`, if the target's files
    /// are reachable from this host.
    fn local_root(&self) -> Option<&Path> {
        None
    }

    /// Mirror a local tree into `dest` on the target.
    ///
    /// Returns whether anything was transferred.
    fn sync_tree(&self, src: &Path, dest: &str, policy: SyncPolicy) -> Result<bool> {
        match self.local_root() {
            Some(root) => crate::executor::sync::copy_tree(src, &rooted(root, dest), policy),
            None => bail!("{} cannot sync trees", self.name()),
        }
    }

    fn exists(&self, ctx: &ExecContext, path: &str) -> Result<bool> {
        match self.local_root() {
            Some(root) => Ok(rooted(root, path).symlink_metadata().is_ok()),
            None => probe(self, ctx, Cmd::new("test").args(["-e", path])),
        }
    }

    fn is_dir(&self, ctx: &ExecContext, path: &str) -> Result<bool> {
        match self.local_root() {
            Some(root) => Ok(rooted(root, path).is_dir()),
            None => probe(self, ctx, Cmd::new("test").args(["-d", path])),
        }
    }

    fn is_symlink(&self, ctx: &ExecContext, path: &str) -> Result<bool> {
        match self.local_root() {
            Some(root) => Ok(rooted(root, path).is_symlink()),
            None => probe(self, ctx, Cmd::new("test").args(["-L", path])),
        }
    }

    /// Read a text file; `None` when it does not exist.
    fn read_file(&self, ctx: &ExecContext, path: &str) -> Result<Option<String>> {
        if !self.exists(ctx, path)? {
            return Ok(None);
        }
        match self.local_root() {
            Some(root) => {
                let full = rooted(root, path);
                let content = std::fs::read_to_string(&full)
                    .with_context(|| format!("reading {}", full.display()))?;
                Ok(Some(content))
            }
            None => {
                let out = self.exec(
                    &Cmd::new("cat")
                        .arg(path)
                        .with_context(ctx)
                        .error_msg(format!("reading {path} on {}", self.name())),
                )?;
                Ok(Some(out.stdout))
            }
        }
    }

    fn write_file(
        &self,
        ctx: &ExecContext,
        path: &str,
        content: &str,
        mode: Option<u32>,
    ) -> Result<()> {
        match self.local_root() {
            Some(root) => local::write_file(&rooted(root, path), content, mode),
            None => {
                self.exec(
                    &Cmd::new("sh")
                        .args(["-c", "cat > \"$1\"", "sh", path])
                        .stdin(content)
                        .with_context(ctx)
                        .error_msg(format!("writing {path} on {}", self.name())),
                )?;
                if let Some(mode) = mode {
                    self.exec(
                        &Cmd::new("chmod")
                            .args([format!("{:o}", mode), path.to_string()])
                            .with_context(ctx),
                    )?;
                }
                Ok(())
            }
        }
    }

    fn create_dir_all(&self, ctx: &ExecContext, path: &str) -> Result<()> {
        match self.local_root() {
            Some(root) => {
                let full = rooted(root, path);
                std::fs::create_dir_all(&full)
                    .with_context(|| format!("creating {}", full.display()))
            }
            None => self
                .exec(&Cmd::new("mkdir").args(["-p", "--", path]).with_context(ctx))
                .map(drop),
        }
    }

    fn rename(&self, ctx: &ExecContext, from: &str, to: &str) -> Result<()> {
        match self.local_root() {
            Some(root) => {
                let (src, dst) = (rooted(root, from), rooted(root, to));
                std::fs::rename(&src, &dst).with_context(|| {
                    format!("renaming {} -> {}", src.display(), dst.display())
                })
            }
            None => self
                .exec(&Cmd::new("mv").args(["-T", "--", from, to]).with_context(ctx))
                .map(drop),
        }
    }

    /// Remove a file or a whole directory tree.
    fn remove_all(&self, ctx: &ExecContext, path: &str) -> Result<()> {
        match self.local_root() {
            Some(root) => local::remove_all(&rooted(root, path)),
            None => self
                .exec(&Cmd::new("rm").args(["-rf", "--", path]).with_context(ctx))
                .map(drop),
        }
    }

    /// Copy a file within the target. Returns `false` when `to` already
    /// has identical content.
    fn copy_file(&self, ctx: &ExecContext, from: &str, to: &str) -> Result<bool> {
        match self.local_root() {
            Some(root) => local::copy_if_changed(&rooted(root, from), &rooted(root, to)),
            None => {
                if probe(self, ctx, Cmd::new("cmp").args(["-s", from, to]))? {
                    return Ok(false);
                }
                self.exec(&Cmd::new("cp").args(["-p", "--", from, to]).with_context(ctx))?;
                Ok(true)
            }
        }
    }

    fn mtime(&self, ctx: &ExecContext, path: &str) -> Result<Option<SystemTime>> {
        if !self.exists(ctx, path)? {
            return Ok(None);
        }
        match self.local_root() {
            Some(root) => {
                let full = rooted(root, path);
                let meta = std::fs::metadata(&full)
                    .with_context(|| format!("stat {}", full.display()))?;
                Ok(Some(meta.modified()?))
            }
            None => {
                let out = self.exec(&Cmd::new("stat").args(["-c", "%Y", path]).with_context(ctx))?;
                let secs: u64 = out
                    .stdout
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing mtime of {path}: {:?}", out.stdout))?;
                Ok(Some(UNIX_EPOCH + Duration::from_secs(secs)))
            }
        }
    }

    fn set_mtime(&self, ctx: &ExecContext, path: &str, mtime: SystemTime) -> Result<()> {
        match self.local_root() {
            Some(root) => local::set_mtime(&rooted(root, path), mtime),
            None => {
                let secs = mtime
                    .duration_since(UNIX_EPOCH)
                    .context("mtime before the epoch")?
                    .as_secs();
                self.exec(
                    &Cmd::new("touch")
                        .args(["-m", "-d", &format!("@{secs}"), "--", path])
                        .with_context(ctx),
                )
                .map(drop)
            }
        }
    }

    /// Hex SHA-256 of a file; `None` when it does not exist.
    fn sha256(&self, ctx: &ExecContext, path: &str) -> Result<Option<String>> {
        if !self.exists(ctx, path)? {
            return Ok(None);
        }
        match self.local_root() {
            Some(root) => local::sha256_file(&rooted(root, path)).map(Some),
            None => {
                let out = self.exec(&Cmd::new("sha256sum").args(["--", path]).with_context(ctx))?;
                let digest = out
                    .stdout
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                Ok(Some(digest))
            }
        }
    }
}

/// Map a target path onto a host directory standing in for its `/`.
pub fn rooted(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

fn probe<C: Connection + ?Sized>(conn: &C, ctx: &ExecContext, cmd: Cmd) -> Result<bool> {
    Ok(conn.exec(&cmd.with_context(ctx).allow_fail())?.success())
}
