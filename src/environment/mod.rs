//! Chroot staging: everything the build phase needs before its first command.
//!
//! [`prepare`] runs these steps in order, each one guarded so a second run
//! is a no-op:
//!
//! 1. Extract the image's root partition (once, see [`extract`])
//! 2. Copy the host's DNS config and the emulator binary in
//! 3. Install the shim that enters the chroot under the emulator
//! 4. Bind-mount host filesystems (see [`mounts`])
//! 5. Comment out `ld.so.preload` (its libraries crash under emulation)
//! 6. Turn off initramfs regeneration (fails under emulation)
//!
//! The result is a [`ChrootTarget`], whose [`ChrootConnection`] drives the
//! build phase.

pub mod extract;
pub mod mounts;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::connection::{ChrootConnection, Connection};
use crate::error::ProvisionError;
use crate::preflight::require_params;
use crate::process::ExecContext;
use crate::step::{op, run_steps, Change, Op, Phase, RunReport, Step};

pub use mounts::{BindMount, MountSet};

/// Where the shim is installed unless configured otherwise.
pub const DEFAULT_SHIM: &str = "/usr/local/bin/arcade-chroot-shell";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// 1-based partition holding the root filesystem.
    pub partition: usize,
    /// Host path of the static user-mode emulator; copied to the same path
    /// inside the chroot.
    pub emulator: PathBuf,
    pub resolv_conf: PathBuf,
    pub shim: PathBuf,
    /// Paths bound from the host, in mount order.
    pub mounts: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            partition: 2,
            emulator: PathBuf::from("/usr/bin/qemu-arm-static"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            shim: PathBuf::from(DEFAULT_SHIM),
            mounts: mounts::DEFAULT_MOUNTS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl EnvironmentConfig {
    pub fn mount_set(&self, root: &Path) -> MountSet {
        MountSet::new(root, &self.mounts)
    }
}

/// Parameters of one `prepare` invocation, as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct PrepareRequest {
    pub image: Option<PathBuf>,
    pub chroot: Option<PathBuf>,
}

impl PrepareRequest {
    /// Both paths, or a precondition error naming every missing one.
    pub fn validate(&self) -> Result<(&Path, &Path)> {
        require_params(&[("image", self.image.is_some()), ("chroot", self.chroot.is_some())])?;
        match (&self.image, &self.chroot) {
            (Some(image), Some(chroot)) => Ok((image.as_path(), chroot.as_path())),
            _ => Err(ProvisionError::precondition("image and chroot are required").into()),
        }
    }
}

/// A prepared chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootTarget {
    root: PathBuf,
    shim: PathBuf,
    emulator: PathBuf,
}

impl ChrootTarget {
    pub fn new(root: impl AsRef<Path>, config: &EnvironmentConfig) -> Self {
        Self {
            root: normalize_root(root.as_ref()),
            shim: config.shim.clone(),
            emulator: config.emulator.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn connection(&self) -> ChrootConnection {
        ChrootConnection::new(&self.root, &self.shim)
    }

    /// Fail unless the chroot, its shim and every bind mount are in place.
    ///
    /// Used when the build phase runs on its own, so no chrooted command can
    /// start before the mounts exist. The shim is installed at one host path
    /// for whichever chroot was prepared last, so its content must enter this
    /// root with this emulator.
    pub fn ensure_ready(&self, host: &dyn Connection, set: &MountSet) -> Result<()> {
        let ctx = ExecContext::new();
        let not_ready = |what: String| -> anyhow::Error {
            ProvisionError::precondition(format!(
                "chroot {} is not prepared ({}); run `arcade-provision prepare` first",
                self.root.display(),
                what
            ))
            .into()
        };

        if !host.is_dir(&ctx, &path_str(&self.root))? {
            return Err(not_ready("directory missing".to_string()));
        }
        let expected = shim_script(&self.root, &self.emulator)?;
        match host.read_file(&ctx, &path_str(&self.shim))? {
            None => return Err(not_ready(format!("shim {} missing", self.shim.display()))),
            Some(script) if script != expected => {
                return Err(not_ready(format!(
                    "shim {} enters a different chroot",
                    self.shim.display()
                )));
            }
            Some(_) => {}
        }
        for mount in set.mount_order() {
            if !mounts::is_mounted(host, &ctx, &mount.target)? {
                return Err(not_ready(format!("{} not mounted", mount.target)));
            }
        }
        Ok(())
    }
}

/// `root` as one canonical spelling: no trailing separator, no `.` components.
///
/// `/srv/pi/` and `/srv/pi` must name the same chroot everywhere, including
/// the staging siblings derived from it.
pub fn normalize_root(root: &Path) -> PathBuf {
    root.components().collect()
}

/// The shim: `exec chroot <root> <emulator> /bin/sh "$@"`.
pub fn shim_script(root: &Path, emulator: &Path) -> Result<String> {
    let quote = |path: &Path| -> Result<String> {
        let text = path.to_string_lossy();
        shlex::try_quote(&text)
            .map(|quoted| quoted.into_owned())
            .map_err(|e| anyhow::anyhow!("cannot quote {}: {}", path.display(), e))
    };
    Ok(format!(
        "#!/bin/sh\n# Enters {} under {}; managed by arcade-provision.\nexec chroot {} {} /bin/sh \"$@\"\n",
        root.display(),
        emulator.display(),
        quote(root)?,
        quote(emulator)?
    ))
}

/// Stage the chroot at `root` from `image`.
///
/// Callers validate privilege and host tools first; see
/// [`preflight`](crate::preflight).
pub fn prepare(
    host: &dyn Connection,
    config: &EnvironmentConfig,
    image: &Path,
    root: &Path,
) -> Result<(ChrootTarget, RunReport)> {
    let target = ChrootTarget::new(root, config);
    let root_buf = target.root().to_path_buf();
    let root = root_buf.as_path();
    let in_chroot = |path: &Path| path_str(&root.join(path.strip_prefix("/").unwrap_or(path)));

    let root_str = path_str(root);
    let partition = config.partition;
    let image = image.to_path_buf();
    let root_path = root.to_path_buf();

    let mut steps = vec![
        Step::run("extract root filesystem", move |host, ctx| {
            extract::extract_root(host, ctx, &image, &root_path, partition)?;
            Ok(Change::Changed)
        })
        .creates(root_str),
        copy_in(
            "copy resolv.conf",
            path_str(&config.resolv_conf),
            in_chroot(&config.resolv_conf),
        ),
        copy_in(
            "copy emulator",
            path_str(&config.emulator),
            in_chroot(&config.emulator),
        ),
        Step::op(
            "install shim",
            op::write_file_mode(
                path_str(&config.shim),
                shim_script(root, &config.emulator)?,
                0o755,
            ),
        ),
    ];

    for mount in config.mount_set(root).mount_order() {
        steps.push(Step::run(format!("mount {}", mount.relative), move |host, ctx| {
            mounts::bind(host, ctx, &mount).map(Change::from_bool)
        }));
    }

    let initramfs_conf = in_chroot(Path::new("/etc/initramfs-tools/update-initramfs.conf"));
    steps.push(Step::op(
        "neutralize ld.so.preload",
        Op::CommentOut(in_chroot(Path::new("/etc/ld.so.preload"))),
    ));
    steps.push(
        Step::op(
            "disable initramfs updates",
            op::key_equals(initramfs_conf.clone(), "update_initramfs", "no"),
        )
        .removes(initramfs_conf),
    );

    let report = run_steps(Phase::Environment, host, steps)?;
    Ok((target, report))
}

/// Copy a host file into the chroot when missing or different.
///
/// A symlink at the destination is replaced rather than followed: it would
/// resolve against the host's root.
fn copy_in<'a>(name: &str, from: String, to: String) -> Step<'a> {
    Step::run(name.to_string(), move |host, ctx| {
        if host.is_symlink(ctx, &to)? {
            host.remove_all(ctx, &to)?;
        }
        host.copy_file(ctx, &from, &to).map(Change::from_bool)
    })
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
