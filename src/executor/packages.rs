//! Package handler: Op::Packages
//!
//! Reads the installed set from dpkg, then installs only what is missing and
//! purges only what is present. Nothing runs when both deltas are empty.

use anyhow::{bail, Result};
use std::collections::BTreeSet;
use tracing::info;

use crate::connection::Connection;
use crate::process::{Cmd, ExecContext};

/// One line per known package: name, tab, dpkg status abbreviation.
const DPKG_FORMAT: &str = "-f=${Package}\\t${db:Status-Abbrev}\\n";

/// Difference between the desired and the installed package sets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackageDelta {
    pub install: Vec<String>,
    pub purge: Vec<String>,
}

impl PackageDelta {
    /// Duplicates in either list are fine; a package wanted both present and
    /// absent is a configuration error.
    pub fn compute(
        present: &[String],
        absent: &[String],
        installed: &BTreeSet<String>,
    ) -> Result<Self> {
        let wanted: BTreeSet<&str> = present.iter().map(String::as_str).collect();
        let unwanted: BTreeSet<&str> = absent.iter().map(String::as_str).collect();

        let conflicts: Vec<&str> = wanted.intersection(&unwanted).copied().collect();
        if !conflicts.is_empty() {
            bail!(
                "packages listed as both present and absent: {}",
                conflicts.join(", ")
            );
        }

        Ok(Self {
            install: wanted
                .iter()
                .filter(|name| !installed.contains(**name))
                .map(|name| name.to_string())
                .collect(),
            purge: unwanted
                .iter()
                .filter(|name| installed.contains(**name))
                .map(|name| name.to_string())
                .collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.purge.is_empty()
    }
}

/// Parse `dpkg-query` output; only fully installed (`ii`) packages count.
pub fn parse_installed(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let (name, status) = line.split_once('\t')?;
            status
                .trim()
                .starts_with("ii")
                .then(|| name.trim().to_string())
        })
        .collect()
}

pub fn installed(conn: &dyn Connection, ctx: &ExecContext) -> Result<BTreeSet<String>> {
    let out = conn.exec(
        &Cmd::new("dpkg-query")
            .args(["-W", DPKG_FORMAT])
            .with_context(ctx)
            .error_msg(format!("listing installed packages on {}", conn.name())),
    )?;
    Ok(parse_installed(&out.stdout))
}

/// Handle Op::Packages.
pub fn ensure(
    conn: &dyn Connection,
    ctx: &ExecContext,
    present: &[String],
    absent: &[String],
) -> Result<bool> {
    let delta = PackageDelta::compute(present, absent, &installed(conn, ctx)?)?;
    if delta.is_empty() {
        return Ok(false);
    }

    if !delta.install.is_empty() {
        info!(host = %conn.name(), packages = %delta.install.join(" "), "installing packages");
        conn.exec(
            &Cmd::new("apt-get")
                .arg("update")
                .with_context(ctx)
                .error_msg("apt-get update failed"),
        )?;
        conn.exec(
            &Cmd::new("apt-get")
                .args(["install", "-y", "--no-install-recommends"])
                .args(&delta.install)
                .env("DEBIAN_FRONTEND", "noninteractive")
                .with_context(ctx)
                .error_msg(format!("installing {}", delta.install.join(" "))),
        )?;
    }

    if !delta.purge.is_empty() {
        info!(host = %conn.name(), packages = %delta.purge.join(" "), "purging packages");
        conn.exec(
            &Cmd::new("apt-get")
                .args(["purge", "-y"])
                .args(&delta.purge)
                .env("DEBIAN_FRONTEND", "noninteractive")
                .with_context(ctx)
                .error_msg(format!("purging {}", delta.purge.join(" "))),
        )?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use tempfile::TempDir;

    const DPKG_OUTPUT: &str = "git\tii \nlibsdl2-dev\tii \nrpd-plym-splash\tii \nnano\trc \n";

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_installed_ignores_removed_packages() {
        let installed = parse_installed(DPKG_OUTPUT);
        assert!(installed.contains("git"));
        assert!(installed.contains("libsdl2-dev"));
        assert!(!installed.contains("nano"));
    }

    #[test]
    fn test_delta_only_touches_differences() {
        let installed = parse_installed(DPKG_OUTPUT);
        let delta = PackageDelta::compute(
            &names(&["git", "libfreetype6-dev", "git", "libfreetype6-dev"]),
            &names(&["rpd-plym-splash", "nano"]),
            &installed,
        )
        .unwrap();

        assert_eq!(delta.install, vec!["libfreetype6-dev"]);
        assert_eq!(delta.purge, vec!["rpd-plym-splash"]);
    }

    #[test]
    fn test_delta_rejects_contradiction() {
        let result = PackageDelta::compute(&names(&["git"]), &names(&["git"]), &BTreeSet::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_runs_nothing_when_converged() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path()).respond("dpkg-query", 0, DPKG_OUTPUT);

        let changed = ensure(&conn, &ExecContext::privileged(), &names(&["git"]), &names(&["nano"])).unwrap();

        assert!(!changed);
        assert_eq!(conn.count("apt-get"), 0);
    }

    #[test]
    fn test_ensure_installs_and_purges_delta() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path()).respond("dpkg-query", 0, DPKG_OUTPUT);

        let changed = ensure(
            &conn,
            &ExecContext::privileged(),
            &names(&["git", "xinit"]),
            &names(&["rpd-plym-splash"]),
        )
        .unwrap();

        assert!(changed);
        let commands = conn.commands();
        assert!(commands.contains(&"apt-get update".to_string()));
        assert!(commands.contains(&"apt-get install -y --no-install-recommends xinit".to_string()));
        assert!(commands.contains(&"apt-get purge -y rpd-plym-splash".to_string()));
    }
}
