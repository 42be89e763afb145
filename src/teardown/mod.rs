//! Removing a prepared chroot without leaving kernel mounts behind.
//!
//! After the operator confirms:
//!
//! 1. Unmount the bind mounts, deepest first, probing each one
//! 2. Unmount anything else the mount table still lists under the root
//! 3. Re-probe; refuse to delete while anything is mounted
//! 4. Delete the tree, then the shim if it enters this chroot

use anyhow::{bail, Context, Result};
use std::io::{self, BufRead, Write};
use std::path::{Component, Path};
use tracing::{info, warn};

use crate::connection::Connection;
use crate::environment::mounts::{self, MountSet};
use crate::environment::{normalize_root, EnvironmentConfig};
use crate::error::ProvisionError;
use crate::process::ExecContext;
use crate::step::{run_steps, Change, Phase, RunReport, Step};

/// `y` or `yes`, any case.
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Ask on stderr, read one line from stdin.
pub fn ask(question: &str) -> Result<bool> {
    let mut stderr = io::stderr();
    write!(stderr, "{} [y/N] ", question)?;
    stderr.flush()?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(is_yes(&answer))
}

fn check_root(root: &Path) -> Result<()> {
    let is_root = root.components().all(|c| matches!(c, Component::RootDir));
    let indirect = root
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
    if !root.is_absolute() || is_root || indirect {
        return Err(ProvisionError::precondition(format!(
            "refusing to tear down {}: need an absolute path below / without `.` or `..`",
            root.display()
        ))
        .into());
    }
    Ok(())
}

/// Unmount and delete the chroot at `root`.
///
/// `confirm` is asked once before anything is touched; declining aborts.
pub fn teardown(
    host: &dyn Connection,
    config: &EnvironmentConfig,
    root: &Path,
    confirm: impl FnOnce(&str) -> Result<bool>,
) -> Result<RunReport> {
    check_root(root)?;
    let root_buf = normalize_root(root);
    let root = root_buf.as_path();
    if !confirm(&format!(
        "Unmount everything under {} and delete it?",
        root.display()
    ))? {
        return Err(ProvisionError::Aborted.into());
    }

    let set = config.mount_set(root);
    let root_str = root.to_string_lossy().into_owned();
    let shim = config.shim.to_string_lossy().into_owned();
    let marker = format!("# Enters {} under", root.display());

    let mut steps: Vec<Step> = set
        .unmount_order()
        .into_iter()
        .map(|mount| {
            Step::run(format!("unmount {}", mount.relative), move |host, ctx| {
                mounts::unmount(host, ctx, &mount.target).map(Change::from_bool)
            })
        })
        .collect();

    steps.push(Step::run("unmount stray mounts", |host, ctx| {
        let mut changed = false;
        for path in mounts::live_mounts_under(host, ctx, root)? {
            let target = path.to_string_lossy();
            warn!(target_path = %target, "unmounting mount not created by prepare");
            changed |= mounts::unmount(host, ctx, &target)?;
        }
        Ok(Change::from_bool(changed))
    }));

    steps.push(Step::run("verify nothing is mounted", |host, ctx| {
        let remaining = still_mounted(host, ctx, &set)?;
        if !remaining.is_empty() {
            bail!(
                "refusing to delete {}: still mounted: {}",
                root.display(),
                remaining.join(", ")
            );
        }
        Ok(Change::Unchanged)
    }));

    steps.push(
        Step::run("delete chroot", |host, ctx| {
            host.remove_all(ctx, &root_str)?;
            info!(root = %root.display(), "chroot deleted");
            Ok(Change::Changed)
        })
        .removes(root_str.clone()),
    );

    steps.push(
        Step::run("remove shim", |host, ctx| {
            host.remove_all(ctx, &shim)?;
            Ok(Change::Changed)
        })
        .when("shim missing or enters another chroot", |host, ctx| {
            Ok(host
                .read_file(ctx, &shim)?
                .is_some_and(|script| script.contains(&marker)))
        }),
    );

    run_steps(Phase::Teardown, host, steps)
}

/// Mount points of `set`, plus anything the mount table lists below its root.
fn still_mounted(host: &dyn Connection, ctx: &ExecContext, set: &MountSet) -> Result<Vec<String>> {
    let mut remaining = Vec::new();
    for mount in set.unmount_order() {
        if mounts::is_mounted(host, ctx, &mount.target)? {
            remaining.push(mount.target);
        }
    }
    for path in mounts::live_mounts_under(host, ctx, set.root())? {
        let path = path.to_string_lossy().into_owned();
        if !remaining.contains(&path) {
            remaining.push(path);
        }
    }
    Ok(remaining)
}
