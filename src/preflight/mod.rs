//! Preflight checks run before a phase touches anything.
//!
//! Validates privilege, required parameters and host tools so a run fails
//! with a clear message instead of half-way through. Every failure here is a
//! [`ProvisionError::Precondition`] and ends the run with exit code 2.
//!
//! # Example
//!
//! ```rust,ignore
//! use arcade_provision::preflight::{check_required_tools, require_params, require_root};
//!
//! require_params(&[("image", image.is_some()), ("chroot", chroot.is_some())])?;
//! require_root()?;
//! check_required_tools(ENVIRONMENT_TOOLS)?;
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;

use crate::error::ProvisionError;
use crate::process::Cmd;

/// Host tools needed to stage a chroot.
///
/// Each tuple is (command_name, package_name).
pub const ENVIRONMENT_TOOLS: &[(&str, &str)] = &[
    ("sfdisk", "fdisk"),
    ("mount", "mount"),
    ("umount", "mount"),
    ("mountpoint", "util-linux"),
    ("chroot", "coreutils"),
    ("cp", "coreutils"),
];

/// Host tools needed to converge cabinets.
pub const FLEET_TOOLS: &[(&str, &str)] = &[("ssh", "openssh-client"), ("rsync", "rsync")];

/// `sfdisk --json` first shipped with util-linux 2.27.
pub const SFDISK_MIN_VERSION: &str = "2.27";

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Fails listing every missing tool with the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(ProvisionError::precondition(format!(
            "missing required host tools:\n{}",
            missing.join("\n")
        ))
        .into());
    }
    Ok(())
}

/// Fail unless the effective uid is 0.
pub fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(ProvisionError::precondition(format!(
            "must run as root (effective uid is {})",
            euid
        ))
        .into());
    }
    Ok(())
}

/// Fail listing every parameter whose flag is `false`.
pub fn require_params(params: &[(&str, bool)]) -> Result<()> {
    let missing: Vec<&str> = params
        .iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(ProvisionError::precondition(format!(
            "missing required parameter(s): {}",
            missing.join(", ")
        ))
        .into());
    }
    Ok(())
}

/// A dotted `major.minor[.patch]` tool version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// First `N.N[.N]` token in `text`.
    pub fn find(text: &str) -> Option<Self> {
        let re = Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok()?;
        let caps = re.captures(text)?;
        let part = |idx: usize| -> Option<u32> {
            caps.get(idx).map_or(Some(0), |m| m.as_str().parse().ok())
        };
        Some(Self {
            major: part(1)?,
            minor: part(2)?,
            patch: part(3)?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compare the version reported in `output` against `minimum`.
pub fn ensure_version(tool: &str, output: &str, minimum: &str) -> Result<Version> {
    let min = Version::find(minimum)
        .with_context(|| format!("invalid minimum version {:?}", minimum))?;
    let found = Version::find(output).ok_or_else(|| {
        ProvisionError::precondition(format!("cannot read the version of {}", tool))
    })?;
    if found.cmp(&min) == Ordering::Less {
        return Err(ProvisionError::precondition(format!(
            "{} {} is too old (need {} or newer)",
            tool, found, min
        ))
        .into());
    }
    Ok(found)
}

/// Run `tool --version` on this host and require at least `minimum`.
pub fn check_min_version(tool: &str, minimum: &str) -> Result<Version> {
    let out = Cmd::new(tool)
        .arg("--version")
        .allow_fail()
        .run()
        .with_context(|| format!("running {} --version", tool))?;
    ensure_version(tool, &format!("{}\n{}", out.stdout, out.stderr), minimum)
}
