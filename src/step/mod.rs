//! Ordered, guarded steps and the run loop that executes them.
//!
//! A phase is a `Vec<Step>`. Each [`Step`] carries:
//! - an action: a declarative [`Op`] or a closure
//! - a [`Guard`] evaluated right before the action
//! - an [`ExecContext`] (identity, working directory, environment)
//! - a [`FailurePolicy`]
//!
//! [`run_steps`] executes them strictly in order. A fatal failure stops the
//! phase; there is no retry. Re-running the phase is the recovery path, and
//! the guards make already-finished work a no-op.
//!
//! # Example
//!
//! ```rust,ignore
//! use arcade_provision::step::{op, run_steps, Phase, Step};
//!
//! let steps = vec![
//!     Step::op("scaffold", op::dirs(["/home/pi/.attract/romlists"])),
//!     Step::op("romlist", op::command(build_romlist)).creates("/home/pi/.attract/romlists/mame.txt"),
//!     Step::op("scrape", op::command(scrape)).when_changed("romlist").best_effort(),
//! ];
//! let report = run_steps(Phase::Fleet, &conn, steps)?;
//! ```

pub mod op;

pub use op::Op;

use anyhow::Result;
use std::fmt;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{is_precondition, ProvisionError};
use crate::executor;
use crate::process::ExecContext;

/// Provisioning phases, in the order a full run executes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Stage the chroot: extract, shim, bind mounts.
    Environment = 1,
    /// Cross-build components inside the chroot.
    Build = 2,
    /// Converge cabinets over SSH.
    Fleet = 3,
    /// Unmount and delete a chroot.
    Teardown = 4,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Environment => write!(f, "Environment"),
            Phase::Build => write!(f, "Build"),
            Phase::Fleet => write!(f, "Fleet"),
            Phase::Teardown => write!(f, "Teardown"),
        }
    }
}

/// What an action did to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Changed,
    Unchanged,
}

impl Change {
    pub fn from_bool(changed: bool) -> Self {
        if changed {
            Change::Changed
        } else {
            Change::Unchanged
        }
    }

    pub fn or(self, other: Change) -> Change {
        Change::from_bool(self == Change::Changed || other == Change::Changed)
    }
}

type Check<'a> = Box<dyn Fn(&dyn Connection, &ExecContext) -> Result<bool> + 'a>;
type Action<'a> = Box<dyn FnMut(&dyn Connection, &ExecContext) -> Result<Change> + 'a>;

/// Decides whether a step's action runs.
pub enum Guard<'a> {
    Always,
    /// Skip when the path exists ("create once").
    Creates(String),
    /// Run only when the path exists.
    Removes(String),
    /// Run only when the named earlier step reported a change.
    Changed(String),
    /// Run only when `check` returns true; `reason` explains a skip.
    When { reason: String, check: Check<'a> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the phase.
    Fatal,
    /// Log, record and continue.
    BestEffort,
}

enum Work<'a> {
    Op(Op),
    Run(Action<'a>),
}

pub struct Step<'a> {
    name: String,
    ctx: ExecContext,
    guard: Guard<'a>,
    work: Work<'a>,
    policy: FailurePolicy,
}

impl<'a> Step<'a> {
    fn new(name: impl Into<String>, work: Work<'a>) -> Self {
        Self {
            name: name.into(),
            ctx: ExecContext::default(),
            guard: Guard::Always,
            work,
            policy: FailurePolicy::Fatal,
        }
    }

    pub fn op(name: impl Into<String>, op: Op) -> Self {
        Self::new(name, Work::Op(op))
    }

    pub fn run(
        name: impl Into<String>,
        action: impl FnMut(&dyn Connection, &ExecContext) -> Result<Change> + 'a,
    ) -> Self {
        Self::new(name, Work::Run(Box::new(action)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(mut self, ctx: ExecContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn creates(mut self, path: impl Into<String>) -> Self {
        self.guard = Guard::Creates(path.into());
        self
    }

    pub fn removes(mut self, path: impl Into<String>) -> Self {
        self.guard = Guard::Removes(path.into());
        self
    }

    pub fn when_changed(mut self, step: impl Into<String>) -> Self {
        self.guard = Guard::Changed(step.into());
        self
    }

    pub fn when(
        mut self,
        reason: impl Into<String>,
        check: impl Fn(&dyn Connection, &ExecContext) -> Result<bool> + 'a,
    ) -> Self {
        self.guard = Guard::When {
            reason: reason.into(),
            check: Box::new(check),
        };
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.policy = FailurePolicy::BestEffort;
        self
    }

    fn skip_reason(&self, conn: &dyn Connection, report: &RunReport) -> Result<Option<String>> {
        Ok(match &self.guard {
            Guard::Always => None,
            Guard::Creates(path) => conn
                .exists(&self.ctx, path)?
                .then(|| format!("{path} exists")),
            Guard::Removes(path) => (!conn.exists(&self.ctx, path)?)
                .then(|| format!("{path} does not exist")),
            Guard::Changed(step) => {
                (!report.changed(step)).then(|| format!("'{step}' made no change"))
            }
            Guard::When { reason, check } => (!check(conn, &self.ctx)?).then(|| reason.clone()),
        })
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Changed,
    Unchanged,
    Skipped(String),
    FailedIgnored(String),
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Changed => write!(f, "changed"),
            StepStatus::Unchanged => write!(f, "ok"),
            StepStatus::Skipped(reason) => write!(f, "skipped ({reason})"),
            StepStatus::FailedIgnored(error) => write!(f, "failed, ignored ({error})"),
        }
    }
}

/// Per-step outcomes of one phase run, in execution order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    steps: Vec<(String, StepStatus)>,
}

impl RunReport {
    pub fn status(&self, step: &str) -> Option<&StepStatus> {
        self.steps
            .iter()
            .rev()
            .find(|(name, _)| name == step)
            .map(|(_, status)| status)
    }

    pub fn changed(&self, step: &str) -> bool {
        self.status(step) == Some(&StepStatus::Changed)
    }

    pub fn changed_steps(&self) -> Vec<&str> {
        self.with_status(|status| *status == StepStatus::Changed)
    }

    pub fn skipped_steps(&self) -> Vec<&str> {
        self.with_status(|status| matches!(status, StepStatus::Skipped(_)))
    }

    pub fn ignored_failures(&self) -> Vec<&str> {
        self.with_status(|status| matches!(status, StepStatus::FailedIgnored(_)))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// One line per step, for the end-of-run summary.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.steps
            .iter()
            .map(|(name, status)| format!("{name}: {status}"))
    }

    fn with_status(&self, pred: impl Fn(&StepStatus) -> bool) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, status)| pred(status))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Execute `steps` in order against `conn`.
pub fn run_steps(phase: Phase, conn: &dyn Connection, steps: Vec<Step<'_>>) -> Result<RunReport> {
    info!(%phase, host = %conn.name(), steps = steps.len(), "phase started");
    let mut report = RunReport::default();
    for step in steps {
        let name = step.name.clone();
        let status = run_step(conn, step, &report)?;
        report.steps.push((name, status));
    }
    info!(
        %phase,
        host = %conn.name(),
        changed = report.changed_steps().len(),
        "phase finished"
    );
    Ok(report)
}

fn run_step(conn: &dyn Connection, mut step: Step<'_>, report: &RunReport) -> Result<StepStatus> {
    let skip = step
        .skip_reason(conn, report)
        .map_err(|err| step_error(&step.name, err))?;
    if let Some(reason) = skip {
        debug!(host = %conn.name(), step = %step.name, %reason, "skipped");
        return Ok(StepStatus::Skipped(reason));
    }

    info!(host = %conn.name(), step = %step.name, "running");
    let result = match &mut step.work {
        Work::Op(op) => executor::execute(conn, &step.ctx, op),
        Work::Run(action) => action(conn, &step.ctx),
    };

    match result {
        Ok(Change::Changed) => {
            info!(host = %conn.name(), step = %step.name, "changed");
            Ok(StepStatus::Changed)
        }
        Ok(Change::Unchanged) => Ok(StepStatus::Unchanged),
        Err(err) if step.policy == FailurePolicy::BestEffort => {
            let error = format!("{err:#}");
            warn!(host = %conn.name(), step = %step.name, %error, "best-effort step failed, continuing");
            Ok(StepStatus::FailedIgnored(error))
        }
        Err(err) => Err(step_error(&step.name, err)),
    }
}

fn step_error(step: &str, err: anyhow::Error) -> anyhow::Error {
    if is_precondition(&err) {
        return err;
    }
    ProvisionError::StepFailed {
        step: step.to_string(),
        message: format!("{err:#}"),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use crate::process::Cmd;
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Environment < Phase::Build);
        assert!(Phase::Build < Phase::Fleet);
        assert_eq!(Phase::Teardown.to_string(), "Teardown");
    }

    #[test]
    fn test_creates_guard_skips_existing_path() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("index.txt"), "").unwrap();
        let conn = FakeConnection::new(temp.path());

        let report = run_steps(
            Phase::Fleet,
            &conn,
            vec![Step::op("index", op::command(Cmd::new("indexer"))).creates("/index.txt")],
        )
        .unwrap();

        assert_eq!(conn.count("indexer"), 0);
        assert_eq!(report.skipped_steps(), vec!["index"]);
    }

    #[test]
    fn test_removes_guard_requires_path() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path());

        let report = run_steps(
            Phase::Environment,
            &conn,
            vec![Step::op("preload", Op::CommentOut("/etc/ld.so.preload".into()))
                .removes("/etc/ld.so.preload")],
        )
        .unwrap();

        assert!(matches!(report.status("preload"), Some(StepStatus::Skipped(_))));
    }

    #[test]
    fn test_when_changed_follows_earlier_step() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path());

        let steps = vec![
            Step::run("first", |_, _| Ok(Change::Unchanged)),
            Step::op("follow-up", op::command(Cmd::new("scrape"))).when_changed("first"),
            Step::run("second", |_, _| Ok(Change::Changed)),
            Step::op("follow-up-2", op::command(Cmd::new("enrich"))).when_changed("second"),
        ];
        let report = run_steps(Phase::Fleet, &conn, steps).unwrap();

        assert_eq!(conn.count("scrape"), 0);
        assert_eq!(conn.count("enrich"), 1);
        assert_eq!(report.changed_steps(), vec!["second", "follow-up-2"]);
    }

    #[test]
    fn test_best_effort_failure_is_recorded_and_run_continues() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path()).respond("scrape", 1, "");
        let after = Cell::new(false);

        let steps = vec![
            Step::op("scrape", op::command(Cmd::new("scrape"))).best_effort(),
            Step::run("after", |_, _| {
                after.set(true);
                Ok(Change::Unchanged)
            }),
        ];
        let report = run_steps(Phase::Fleet, &conn, steps).unwrap();

        assert!(after.get());
        assert_eq!(report.ignored_failures(), vec!["scrape"]);
    }

    #[test]
    fn test_fatal_failure_stops_phase() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path()).respond("make", 2, "");
        let after = Cell::new(false);

        let steps = vec![
            Step::op("build", op::command(Cmd::new("make"))),
            Step::run("install", |_, _| {
                after.set(true);
                Ok(Change::Changed)
            }),
        ];
        let err = run_steps(Phase::Build, &conn, steps).unwrap_err();

        assert!(!after.get());
        assert!(err.to_string().starts_with("step 'build' failed"));
        assert!(!is_precondition(&err));
    }

    #[test]
    fn test_precondition_passes_through_unwrapped() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path());

        let steps = vec![Step::run("mount proc", |_, _| {
            Err(ProvisionError::precondition("mount point /proc missing").into())
        })];
        let err = run_steps(Phase::Environment, &conn, steps).unwrap_err();

        assert!(is_precondition(&err));
    }

    #[test]
    fn test_change_combination() {
        assert_eq!(Change::Unchanged.or(Change::Changed), Change::Changed);
        assert_eq!(Change::Unchanged.or(Change::Unchanged), Change::Unchanged);
        assert_eq!(Change::from_bool(true), Change::Changed);
    }
}
