//! Remote cabinets reached with the system `ssh` client.

use anyhow::{Context, Result};
use std::path::Path;

use super::Connection;
use crate::executor::sync::{itemized_changes, rsync_args, SyncPolicy};
use crate::fleet::inventory::Host;
use crate::process::{Cmd, CmdOutput};

const SSH_OPTIONS: &[&str] = &["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"];

pub struct SshConnection {
    name: String,
    address: String,
    user: String,
    port: u16,
}

impl SshConnection {
    pub fn new(host: &Host) -> Self {
        Self {
            name: host.name.clone(),
            address: host.address().to_string(),
            user: host.user.clone(),
            port: host.port,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Command line actually run on this host for `cmd`.
    pub fn wrap(&self, cmd: &Cmd) -> Result<Cmd> {
        let mut outer = Cmd::new("ssh")
            .args(SSH_OPTIONS.iter().copied())
            .args(["-p".to_string(), self.port.to_string(), self.destination()])
            .arg("--")
            .arg(cmd.shell_line(&self.user)?)
            .allow_fail();
        if let Some(input) = cmd.stdin_data() {
            outer = outer.stdin(input);
        }
        if cmd.is_interactive() {
            outer = outer.interactive();
        }
        Ok(outer)
    }

    /// Fails unless the host accepts a non-interactive login.
    pub fn check_reachable(&self) -> Result<()> {
        self.exec(&Cmd::new("true").error_msg(format!(
            "{} is unreachable over ssh as {}",
            self.name,
            self.destination()
        )))
        .map(drop)
    }
}

impl Connection for SshConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn login_user(&self) -> &str {
        &self.user
    }

    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let output = self.wrap(cmd)?.run()?;
        // ssh reserves 255 for its own failures
        if output.code == Some(255) {
            anyhow::bail!(
                "ssh to {} failed: {}",
                self.destination(),
                output.stderr.trim()
            );
        }
        cmd.check(output)
    }

    fn sync_tree(&self, src: &Path, dest: &str, policy: SyncPolicy) -> Result<bool> {
        let shell = format!("ssh {} -p {}", SSH_OPTIONS.join(" "), self.port);
        let out = Cmd::new("rsync")
            .args(rsync_args(policy))
            .args(["-e".to_string(), shell])
            .arg(format!("{}/", src.display()))
            .arg(format!("{}:{}/", self.destination(), dest.trim_end_matches('/')))
            .error_msg(format!("syncing {} to {}", src.display(), self.name))
            .run()
            .with_context(|| format!("rsync to {}", self.name))?;
        Ok(itemized_changes(&out.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cabinet() -> SshConnection {
        SshConnection::new(&Host {
            name: "arcade1".into(),
            address: Some("192.168.1.50".into()),
            user: "pi".into(),
            port: 2222,
        })
    }

    #[test]
    fn test_wrap_targets_host_and_port() {
        let outer = cabinet().wrap(&Cmd::new("true")).unwrap();
        let args = outer.get_args();

        assert_eq!(outer.program(), "ssh");
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.contains(&"pi@192.168.1.50".to_string()));
        assert_eq!(args.last().unwrap(), "true");
    }

    #[test]
    fn test_wrap_escalates_privileged_commands() {
        let outer = cabinet()
            .wrap(&Cmd::new("systemctl").args(["enable", "attract.service"]).become_user("root"))
            .unwrap();
        assert!(outer.get_args().last().unwrap().starts_with("sudo -n sh -c"));
    }
}
