//! Converging cabinets over SSH.
//!
//! [`host_steps`] is the whole desired state of one cabinet as an ordered
//! step list:
//!
//! 1. System edits: hostname, `/etc/hosts`, kernel command line,
//!    `/boot/config.txt`, resource limits, default firmware config
//! 2. Package delta
//! 3. Legacy layout migrations, then directory scaffolding
//! 4. The overwrite tree, then the keep-existing tree
//! 5. systemd unit files (reloaded when they changed)
//! 6. Configuration key upserts, service enablement
//! 7. Per emulator: romlist (first run only), then best-effort scraping
//!
//! [`configure_group`] runs it against every host of an inventory group.

pub mod inventory;
pub mod romlist;

use anyhow::{anyhow, Result};
use regex::escape;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info};

use crate::connection::{Connection, SshConnection};
use crate::executor::sync::SyncPolicy;
use crate::executor::{files, services};
use crate::process::{Cmd, ExecContext};
use crate::step::{op, run_steps, Change, Op, Phase, RunReport, Step};

pub use inventory::{Host, Inventory};
pub use romlist::Emulator;

const HOSTNAME_FILE: &str = "/etc/hostname";
const HOSTS_FILE: &str = "/etc/hosts";
const BOOT_CMDLINE: &str = "/boot/cmdline.txt";
const BOOT_CONFIG: &str = "/boot/config.txt";
const BOOT_CONFIG_DEFAULT: &str = "/boot/config.txt.default";
const LIMITS_FILE: &str = "/etc/security/limits.conf";
const SYSTEM_UNIT_DIR: &str = "/etc/systemd/system";

/// A line to replace-or-append. Without `regexp`, a `key=value` line
/// replaces the (possibly commented) line for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LineEdit {
    pub line: String,
    #[serde(default)]
    pub regexp: Option<String>,
}

impl LineEdit {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            regexp: None,
        }
    }

    pub fn matching(line: impl Into<String>, regexp: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            regexp: Some(regexp.into()),
        }
    }

    pub fn regexp(&self) -> String {
        if let Some(regexp) = &self.regexp {
            return regexp.clone();
        }
        match self.line.split_once('=') {
            Some((key, _)) => format!(r"^#?\s*{}=", escape(key.trim())),
            None => format!(r"^#?\s*{}\s*$", escape(self.line.trim())),
        }
    }
}

/// `limits.conf` entries are identified by domain, type and item.
fn limits_regexp(line: &str) -> String {
    let fields: Vec<String> = line.split_whitespace().take(3).map(escape).collect();
    format!(r"^\s*{}\s", fields.join(r"\s+"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageSet {
    pub present: Vec<String>,
    pub absent: Vec<String>,
}

impl Default for PackageSet {
    fn default() -> Self {
        Self {
            present: strings(&["rsync", "curl", "joystick", "evtest", "libopenal1", "libfreetype6"]),
            absent: strings(&["rpd-plym-splash", "triggerhappy", "dphys-swapfile"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Migration {
    pub from: String,
    pub to: String,
}

/// A local tree mirrored into the cabinet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncTree {
    pub src: PathBuf,
    /// Target directory; the user's home when unset.
    #[serde(default)]
    pub dest: Option<String>,
    pub policy: SyncPolicy,
}

/// A `(file, key, value)` upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeySetting {
    pub file: String,
    pub key: String,
    pub value: String,
    /// Used only when the key has to be appended.
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    "    ".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    /// Login that owns the Attract-Mode data.
    pub user: String,
    pub home: String,
    /// Hostname to set; the inventory name when unset.
    pub hostname: Option<String>,
    pub cmdline: Vec<String>,
    pub boot_config: Vec<LineEdit>,
    /// Stock firmware config fetched once to `/boot/config.txt.default`.
    pub boot_config_url: Option<String>,
    pub limits: Vec<String>,
    pub packages: PackageSet,
    pub migrations: Vec<Migration>,
    /// Relative to `<home>/.attract`.
    pub directories: Vec<String>,
    pub trees: Vec<SyncTree>,
    /// Unit files delivered under `<home>/<units_dir>` by a synced tree and
    /// installed into `/etc/systemd/system`.
    pub unit_files: Vec<String>,
    pub units_dir: String,
    pub settings: Vec<KeySetting>,
    pub services: Vec<String>,
    pub emulators: Vec<Emulator>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            user: "pi".to_string(),
            home: "/home/pi".to_string(),
            hostname: None,
            cmdline: strings(&[
                "consoleblank=0",
                "quiet",
                "logo.nologo",
                "loglevel=3",
                "vt.global_cursor_default=0",
            ]),
            boot_config: vec![
                LineEdit::new("disable_splash=1"),
                LineEdit::new("avoid_warnings=1"),
                LineEdit::new("gpu_mem=256"),
                LineEdit::new("hdmi_force_hotplug=1"),
                LineEdit::matching("dtoverlay=vc4-kms-v3d", r"^#?\s*dtoverlay=vc4-f?kms-v3d"),
            ],
            boot_config_url: None,
            limits: strings(&["pi - rtprio 95", "pi - memlock unlimited"]),
            packages: PackageSet::default(),
            migrations: vec![Migration {
                from: "/home/pi/mame/roms".into(),
                to: "/home/pi/.attract/mame/roms".into(),
            }],
            directories: strings(&[
                "romlists",
                "emulators",
                "layouts",
                "scraper",
                "stats",
                "mame/roms",
                "mame/cfg",
                "mame/nvram",
                "mame/sta",
                "mame/snap",
                "mame/inp",
            ]),
            trees: vec![
                SyncTree {
                    src: PathBuf::from("files/overwrite"),
                    dest: None,
                    policy: SyncPolicy::Overwrite,
                },
                SyncTree {
                    src: PathBuf::from("files/keep-existing"),
                    dest: None,
                    policy: SyncPolicy::KeepExisting,
                },
            ],
            unit_files: strings(&["attract.service"]),
            units_dir: ".config/arcade-provision/units".to_string(),
            settings: vec![KeySetting {
                file: "/home/pi/.attract/attract.cfg".into(),
                key: "window_mode".into(),
                value: "fullscreen".into(),
                separator: default_separator(),
            }],
            services: strings(&["attract.service"]),
            emulators: vec![Emulator::new("mame")],
        }
    }
}

impl FleetConfig {
    pub fn attract_dir(&self) -> String {
        format!("{}/.attract", self.home.trim_end_matches('/'))
    }

    fn in_home(&self, path: &str) -> bool {
        path.starts_with(&format!("{}/", self.home.trim_end_matches('/')))
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The full desired state of the cabinet `host_name`.
pub fn host_steps<'a>(config: &'a FleetConfig, host_name: &str) -> Vec<Step<'a>> {
    let root = ExecContext::privileged();
    let user = ExecContext::as_user(config.user.as_str()).workdir(config.home.as_str());
    let hostname = config.hostname.as_deref().unwrap_or(host_name);
    let attract = config.attract_dir();

    let mut steps = vec![
        Step::op("hostname", op::write_file(HOSTNAME_FILE, format!("{}\n", hostname)))
            .context(root.clone()),
        Step::op(
            "apply hostname",
            op::command(Cmd::new("hostname").arg(hostname).error_msg("setting hostname")),
        )
        .context(root.clone())
        .when_changed("hostname"),
        Step::op(
            "hosts entry",
            op::line_in_file(HOSTS_FILE, r"^127\.0\.1\.1\s", format!("127.0.1.1\t{}", hostname)),
        )
        .context(root.clone()),
        Step::op(
            "kernel command line",
            Op::CmdlineParams {
                path: BOOT_CMDLINE.into(),
                params: config.cmdline.clone(),
            },
        )
        .context(root.clone()),
    ];

    for edit in &config.boot_config {
        steps.push(
            Step::op(
                format!("boot config {}", edit.line),
                op::line_in_file(BOOT_CONFIG, edit.regexp(), edit.line.as_str()),
            )
            .context(root.clone()),
        );
    }
    for line in &config.limits {
        steps.push(
            Step::op(
                format!("limits {}", line),
                op::line_in_file(LIMITS_FILE, limits_regexp(line), line.as_str()),
            )
            .context(root.clone()),
        );
    }
    if let Some(url) = &config.boot_config_url {
        let fetch = Cmd::new("curl")
            .args(["-fsSL", url.as_str(), "-o", BOOT_CONFIG_DEFAULT])
            .error_msg(format!("downloading {}", url));
        steps.push(
            Step::op("default boot config", op::command(fetch))
                .context(root.clone())
                .creates(BOOT_CONFIG_DEFAULT),
        );
    }

    steps.push(
        Step::op(
            "packages",
            Op::Packages {
                present: config.packages.present.clone(),
                absent: config.packages.absent.clone(),
            },
        )
        .context(root.clone()),
    );

    for migration in &config.migrations {
        steps.push(
            Step::op(
                format!("migrate {}", migration.from),
                Op::Migrate {
                    from: migration.from.clone(),
                    to: migration.to.clone(),
                },
            )
            .context(user.clone()),
        );
    }
    steps.push(
        Step::op(
            "scaffold directories",
            op::dirs(config.directories.iter().map(|dir| format!("{}/{}", attract, dir))),
        )
        .context(user.clone()),
    );

    for tree in &config.trees {
        let src = tree.src.clone();
        steps.push(
            Step::op(
                format!("sync {} ({})", tree.src.display(), tree.policy),
                Op::Sync {
                    src: tree.src.clone(),
                    dest: tree.dest.clone().unwrap_or_else(|| config.home.clone()),
                    policy: tree.policy,
                },
            )
            .when("local tree missing", move |_, _| Ok(src.is_dir())),
        );
    }

    if !config.unit_files.is_empty() {
        let units_dir = format!("{}/{}", config.home.trim_end_matches('/'), config.units_dir);
        steps.push(
            Step::run("unit files", move |conn, ctx| {
                let mut changed = false;
                for unit in &config.unit_files {
                    let from = format!("{}/{}", units_dir, unit);
                    let to = format!("{}/{}", SYSTEM_UNIT_DIR, unit);
                    changed |= files::copy_file(conn, ctx, &from, &to)?;
                }
                Ok(Change::from_bool(changed))
            })
            .context(root.clone()),
        );
        steps.push(
            Step::op("daemon-reload", op::command(services::daemon_reload()))
                .context(root.clone())
                .when_changed("unit files"),
        );
    }

    for setting in &config.settings {
        let ctx = if config.in_home(&setting.file) {
            user.clone()
        } else {
            root.clone()
        };
        steps.push(
            Step::op(
                format!("setting {} {}", setting.file, setting.key),
                Op::KeyValue {
                    path: setting.file.clone(),
                    key: setting.key.clone(),
                    value: setting.value.clone(),
                    separator: setting.separator.clone(),
                },
            )
            .context(ctx)
            .removes(setting.file.as_str()),
        );
    }

    if !config.services.is_empty() {
        steps.push(
            Step::op("services", Op::EnableServices(config.services.clone())).context(root.clone()),
        );
    }

    for emulator in &config.emulators {
        steps.extend(romlist::steps(emulator, &attract, &user));
    }

    steps
}

/// Converge one cabinet.
pub fn converge_host(conn: &dyn Connection, config: &FleetConfig, host_name: &str) -> Result<RunReport> {
    run_steps(Phase::Fleet, conn, host_steps(config, host_name))
}

/// Converge every host of `group`, one after another.
///
/// A failing host does not stop the others; the run fails afterwards if any
/// host failed.
pub fn configure_group(
    config: &FleetConfig,
    inventory: &Inventory,
    group: &str,
) -> Result<BTreeMap<String, RunReport>> {
    let hosts = inventory.group(group)?;
    info!(group, hosts = hosts.len(), "configuring group");

    let mut reports = BTreeMap::new();
    let mut failed = Vec::new();
    for host in hosts {
        let conn = SshConnection::new(host);
        let result = conn
            .check_reachable()
            .and_then(|()| converge_host(&conn, config, &host.name));
        match result {
            Ok(report) => {
                reports.insert(host.name.clone(), report);
            }
            Err(err) => {
                error!(host = %host.name, error = %format!("{err:#}"), "host failed");
                failed.push(host.name.clone());
            }
        }
    }

    if failed.is_empty() {
        Ok(reports)
    } else {
        Err(anyhow!(
            "{} of {} host(s) in '{}' failed: {}",
            failed.len(),
            hosts.len(),
            group,
            failed.join(", ")
        ))
    }
}
