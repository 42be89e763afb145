//! Child process execution.
//!
//! A [`Cmd`] describes one external command: program, arguments, environment,
//! working directory, the identity to run it as, and how to judge its exit
//! status. A [`Connection`](crate::connection::Connection) decides where the
//! command runs; [`Cmd::run`] runs it on this host.
//!
//! ```rust,ignore
//! Cmd::new("make")
//!     .args(["-j4", "install"])
//!     .current_dir("/home/pi/src/attract")
//!     .become_user("root")
//!     .error_msg("attract install failed")
//!     .run()?;
//! ```

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

/// Identity, working directory and environment a step's commands run with.
///
/// Threaded explicitly through every step instead of living in global state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecContext {
    pub become_user: Option<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands as `user` (escalating through sudo when needed).
    pub fn as_user(user: impl Into<String>) -> Self {
        Self {
            become_user: Some(user.into()),
            ..Self::default()
        }
    }

    /// Run commands as root.
    pub fn privileged() -> Self {
        Self::as_user("root")
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Builder for one external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    workdir: Option<String>,
    become_user: Option<String>,
    stdin: Option<String>,
    error_msg: Option<String>,
    allow_fail: bool,
    ok_codes: Vec<i32>,
    interactive: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: None,
            become_user: None,
            stdin: None,
            error_msg: None,
            allow_fail: false,
            ok_codes: Vec::new(),
            interactive: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn become_user(mut self, user: impl Into<String>) -> Self {
        self.become_user = Some(user.into());
        self
    }

    /// Fill in identity, working directory and environment from `ctx`.
    ///
    /// Values already set on the command win.
    pub fn with_context(mut self, ctx: &ExecContext) -> Self {
        if self.become_user.is_none() {
            self.become_user = ctx.become_user.clone();
        }
        if self.workdir.is_none() {
            self.workdir = ctx.workdir.clone();
        }
        for (key, value) in &ctx.env {
            self.env
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Never turn the exit status into an error; the caller inspects it.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Extra exit codes that count as success for this command only.
    pub fn ok_codes(mut self, codes: &[i32]) -> Self {
        self.ok_codes.extend_from_slice(codes);
        self
    }

    /// Stream output to the terminal instead of capturing it.
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_become_user(&self) -> Option<&str> {
        self.become_user.as_deref()
    }

    pub fn stdin_data(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Render as a single `sh -c` line for a session logged in as `login_user`.
    ///
    /// Working directory and environment are inlined; a different target
    /// identity wraps the line in `sudo -n`.
    pub fn shell_line(&self, login_user: &str) -> Result<String> {
        let mut line = String::new();
        if let Some(dir) = &self.workdir {
            line.push_str(&format!("cd {} && ", quote(dir)?));
        }
        if !self.env.is_empty() {
            line.push_str("env ");
            for (key, value) in &self.env {
                line.push_str(&quote(&format!("{key}={value}"))?);
                line.push(' ');
            }
        }
        line.push_str(&quote(&self.program)?);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg)?);
        }

        match self.become_user.as_deref() {
            Some(user) if user != login_user => {
                let sudo = if user == "root" {
                    "sudo -n sh -c".to_string()
                } else {
                    format!("sudo -n -H -u {} sh -c", quote(user)?)
                };
                Ok(format!("{} {}", sudo, quote(&line)?))
            }
            _ => Ok(line),
        }
    }

    /// Judge a finished command's output against this command's policy.
    pub fn check(&self, output: CmdOutput) -> Result<CmdOutput> {
        let accepted =
            output.success() || output.code.is_some_and(|code| self.ok_codes.contains(&code));
        if accepted || self.allow_fail {
            return Ok(output);
        }

        let status = match output.code {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".to_string(),
        };
        let what = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("`{}` failed", self));
        let stderr = output.stderr.trim();
        if stderr.is_empty() {
            bail!("{} ({})", what, status);
        }
        bail!("{} ({}): {}", what, status, stderr)
    }

    /// Run on this host, blocking until the command exits.
    pub fn run(&self) -> Result<CmdOutput> {
        let mut command = match self.become_user.as_deref() {
            Some(user) if !is_current_identity(user) => {
                let mut command = Command::new("sudo");
                command.args(["-n", "-H", "-u", user, "--", "env"]);
                command.args(self.env.iter().map(|(key, value)| format!("{key}={value}")));
                command.arg(&self.program).args(&self.args);
                command
            }
            _ => {
                let mut command = Command::new(&self.program);
                command.args(&self.args).envs(&self.env);
                command
            }
        };

        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        command.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if self.interactive {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning `{}`", self))?;
        if let Some(input) = &self.stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin of `{}` was not captured", self))?;
            pipe.write_all(input.as_bytes())
                .with_context(|| format!("writing stdin of `{}`", self))?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for `{}`", self))?;

        self.check(CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            match shlex::try_quote(arg) {
                Ok(quoted) => write!(f, " {}", quoted)?,
                Err(_) => write!(f, " {:?}", arg)?,
            }
        }
        Ok(())
    }
}

fn quote(value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .map_err(|e| anyhow!("cannot quote {:?} for the shell: {}", value, e))
}

fn is_current_identity(user: &str) -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if user == "root" {
        return euid == 0;
    }
    euid != 0 && std::env::var("USER").is_ok_and(|current| current == user)
}
