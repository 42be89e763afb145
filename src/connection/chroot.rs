//! The prepared chroot, driven through the emulator shim.
//!
//! Commands become `<shim> -c '<line>'`; the shim enters the chroot and runs
//! `/bin/sh` under the emulator. Files are touched directly on the host
//! under the chroot root.

use anyhow::Result;
use std::path::{Path, PathBuf};

use super::Connection;
use crate::process::{Cmd, CmdOutput};

pub struct ChrootConnection {
    name: String,
    root: PathBuf,
    shim: PathBuf,
}

impl ChrootConnection {
    pub fn new(root: impl Into<PathBuf>, shim: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: format!("chroot:{}", root.display()),
            root,
            shim: shim.into(),
        }
    }

    /// Command line actually run on the host for `cmd`.
    pub fn wrap(&self, cmd: &Cmd) -> Result<Cmd> {
        let mut outer = Cmd::new(self.shim.to_string_lossy().into_owned())
            .arg("-c")
            .arg(cmd.shell_line(self.login_user())?)
            .allow_fail();
        if let Some(input) = cmd.stdin_data() {
            outer = outer.stdin(input);
        }
        if cmd.is_interactive() {
            outer = outer.interactive();
        }
        Ok(outer)
    }
}

impl Connection for ChrootConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn login_user(&self) -> &str {
        "root"
    }

    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let output = self.wrap(cmd)?.run()?;
        cmd.check(output)
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
