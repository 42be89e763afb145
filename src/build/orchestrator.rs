//! The build phase as a step list.
//!
//! ```text
//! install build dependencies                 (root, once, package delta)
//! for each component:
//!   snapshot generated file                  (if configured)
//!   fetch                                    (build user; clone or fetch + checkout)
//!   configure                                (build user; skipped by a matching stamp)
//!   keep generated file mtime                (if configured)
//!   build                                    (build user, make -jN)
//!   install                                  (root)
//!   refresh linker cache                     (root, shared-library components)
//!   record build stamp
//! ```
//!
//! Every step after fetch is guarded by the build stamp, so an unchanged
//! component costs one `git fetch` on a re-run.

use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use tracing::info;

use super::stamp::{self, Snapshot};
use super::{BuildConfig, BuildSystem, ComponentSpec, INSTALL_PREFIX};
use crate::connection::Connection;
use crate::process::{Cmd, ExecContext};
use crate::step::{run_steps, Change, Op, Phase, RunReport, Step};

/// Per-component facts discovered while the phase runs.
#[derive(Debug, Default)]
struct ComponentState {
    revision: RefCell<Option<String>>,
    snapshot: RefCell<Option<Snapshot>>,
}

impl ComponentState {
    fn stamp(&self, config: &BuildConfig, spec: &ComponentSpec) -> Result<String> {
        let revision = self.revision.borrow();
        let revision = revision
            .as_deref()
            .with_context(|| format!("revision of {} unknown before fetch", spec.name))?;
        Ok(stamp::compute(revision, config, spec))
    }
}

/// Build every configured component inside the chroot.
pub fn build_all(conn: &dyn Connection, config: &BuildConfig) -> Result<RunReport> {
    config.validate()?;
    let jobs = config.jobs();
    info!(
        components = config.components.len(),
        jobs,
        arch_flags = %config.arch_flags,
        "building components"
    );

    let states: Vec<ComponentState> = config
        .components
        .iter()
        .map(|_| ComponentState::default())
        .collect();

    let mut steps = vec![Step::op(
        "install build dependencies",
        Op::Packages {
            present: config.dependencies(),
            absent: Vec::new(),
        },
    )
    .context(ExecContext::privileged())];
    for (spec, state) in config.components.iter().zip(&states) {
        steps.extend(component_steps(config, spec, state, jobs));
    }

    run_steps(Phase::Build, conn, steps)
}

fn component_steps<'a>(
    config: &'a BuildConfig,
    spec: &'a ComponentSpec,
    state: &'a ComponentState,
    jobs: usize,
) -> Vec<Step<'a>> {
    let src = config.source_dir(spec);
    let label = |what: &str| format!("{}: {}", spec.name, what);
    let user = ExecContext::as_user(config.user.as_str());
    let build_env = ExecContext::as_user(config.user.as_str())
        .workdir(src.clone())
        .env("CFLAGS", config.arch_flags.as_str())
        .env("CXXFLAGS", config.arch_flags.as_str());
    let root = ExecContext::privileged().workdir(src.clone());
    let stale = move |conn: &dyn Connection, ctx: &ExecContext| -> Result<bool> {
        let expected = state.stamp(config, spec)?;
        stamp::is_stale(conn, ctx, &stamp::stamp_path(config, spec), &expected)
    };
    const UP_TO_DATE: &str = "build stamp matches";

    let mut steps = Vec::new();
    let generated = spec
        .generated_file
        .as_ref()
        .map(|file| format!("{}/{}", src, file));

    if let Some(path) = generated.clone() {
        steps.push(
            Step::run(label("snapshot generated file"), move |conn, ctx| {
                *state.snapshot.borrow_mut() = Snapshot::take(conn, ctx, &path)?;
                Ok(Change::Unchanged)
            })
            .context(user.clone()),
        );
    }

    steps.push(
        Step::run(label("fetch"), move |conn, ctx| fetch(conn, ctx, config, spec, state))
            .context(user.clone()),
    );

    if let Some(cmd) = configure_command(config, spec) {
        steps.push(
            Step::op(label("configure"), Op::Command(cmd))
                .context(build_env.clone())
                .when(UP_TO_DATE, stale),
        );
    }

    if let Some(path) = generated {
        steps.push(
            Step::run(label("keep generated file mtime"), move |conn, ctx| {
                match state.snapshot.borrow().as_ref() {
                    Some(snapshot) => snapshot
                        .restore_if_identical(conn, ctx, &path)
                        .map(Change::from_bool),
                    None => Ok(Change::Unchanged),
                }
            })
            .context(user.clone())
            .when(UP_TO_DATE, stale),
        );
    }

    steps.push(
        Step::op(label("build"), Op::Command(build_command(config, spec, jobs)))
            .context(build_env)
            .when(UP_TO_DATE, stale),
    );
    steps.push(
        Step::op(label("install"), Op::Command(install_command(spec)))
            .context(root)
            .when(UP_TO_DATE, stale),
    );
    if spec.shared_libs {
        steps.push(
            Step::op(
                label("refresh linker cache"),
                Op::Command(Cmd::new("ldconfig").error_msg("ldconfig failed")),
            )
            .context(ExecContext::privileged())
            .when(UP_TO_DATE, stale),
        );
    }

    steps.push(
        Step::run(label("record build stamp"), move |conn, ctx| {
            let expected = state.stamp(config, spec)?;
            conn.write_file(ctx, &stamp::stamp_path(config, spec), &format!("{}\n", expected), None)?;
            Ok(Change::Changed)
        })
        .context(user)
        .when(UP_TO_DATE, stale),
    );

    steps
}

/// Clone or update the checkout, then record its revision.
///
/// Reports a change only when the revision moved.
fn fetch(
    conn: &dyn Connection,
    ctx: &ExecContext,
    config: &BuildConfig,
    spec: &ComponentSpec,
    state: &ComponentState,
) -> Result<Change> {
    let src = config.source_dir(spec);
    let depth = spec.depth.max(1).to_string();

    let before = if conn.exists(ctx, &format!("{}/.git", src))? {
        let before = revision(conn, ctx, &src)?;
        conn.exec(
            &Cmd::new("git")
                .args(["fetch", "--depth", depth.as_str(), "origin", spec.git_ref.as_str()])
                .current_dir(src.as_str())
                .with_context(ctx)
                .error_msg(format!("fetching {} {}", spec.name, spec.git_ref)),
        )?;
        conn.exec(
            &Cmd::new("git")
                .args(["checkout", "--force", "FETCH_HEAD"])
                .current_dir(src.as_str())
                .with_context(ctx)
                .error_msg(format!("checking out {} {}", spec.name, spec.git_ref)),
        )?;
        Some(before)
    } else {
        conn.exec(
            &Cmd::new("mkdir")
                .args(["-p", config.source_root.as_str()])
                .with_context(ctx),
        )?;
        conn.exec(
            &Cmd::new("git")
                .args(["clone", "--depth", depth.as_str(), "--branch", spec.git_ref.as_str()])
                .args([spec.repo.as_str(), src.as_str()])
                .with_context(ctx)
                .error_msg(format!("cloning {} from {}", spec.name, spec.repo)),
        )?;
        None
    };

    let after = revision(conn, ctx, &src)?;
    let changed = before.as_deref() != Some(after.as_str());
    if changed {
        info!(component = %spec.name, revision = %after, "new revision");
    }
    *state.revision.borrow_mut() = Some(after);
    Ok(Change::from_bool(changed))
}

fn revision(conn: &dyn Connection, ctx: &ExecContext, src: &str) -> Result<String> {
    let out = conn.exec(
        &Cmd::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(src)
            .with_context(ctx)
            .error_msg(format!("reading revision of {}", src)),
    )?;
    let rev = out.stdout.trim();
    if rev.is_empty() {
        bail!("git rev-parse printed nothing in {}", src);
    }
    Ok(rev.to_string())
}

fn configure_command(config: &BuildConfig, spec: &ComponentSpec) -> Option<Cmd> {
    let args = spec.configure_args.iter().map(|arg| config.expand(arg));
    let cmd = match spec.system {
        BuildSystem::Autotools => Cmd::new("./configure")
            .arg(format!("--prefix={}", INSTALL_PREFIX))
            .args(args),
        BuildSystem::Cmake => Cmd::new("cmake")
            .args(["-S", ".", "-B", "build"])
            .arg(format!("-DCMAKE_INSTALL_PREFIX={}", INSTALL_PREFIX))
            .arg(format!("-DCMAKE_C_FLAGS={}", config.arch_flags))
            .arg(format!("-DCMAKE_CXX_FLAGS={}", config.arch_flags))
            .args(args),
        BuildSystem::Make => return None,
    };
    Some(cmd.error_msg(format!("configuring {}", spec.name)))
}

fn build_command(config: &BuildConfig, spec: &ComponentSpec, jobs: usize) -> Cmd {
    let args: Vec<String> = spec.make_args.iter().map(|arg| config.expand(arg)).collect();
    let cmd = match spec.system {
        BuildSystem::Cmake => {
            let cmd = Cmd::new("cmake").args([
                "--build".to_string(),
                "build".to_string(),
                "--parallel".to_string(),
                jobs.to_string(),
            ]);
            if args.is_empty() {
                cmd
            } else {
                cmd.arg("--").args(args)
            }
        }
        BuildSystem::Autotools | BuildSystem::Make => {
            Cmd::new("make").arg(format!("-j{}", jobs)).args(args)
        }
    };
    // make output is long; stream it
    cmd.interactive().error_msg(format!("building {}", spec.name))
}

fn install_command(spec: &ComponentSpec) -> Cmd {
    let cmd = match (&spec.install_command, spec.system) {
        // validate() rejects empty argv
        (Some(argv), _) if !argv.is_empty() => Cmd::new(argv[0].as_str()).args(&argv[1..]),
        (_, BuildSystem::Cmake) => Cmd::new("cmake").args(["--install", "build"]),
        _ => Cmd::new("make").arg("install"),
    };
    cmd.error_msg(format!("installing {}", spec.name))
}
