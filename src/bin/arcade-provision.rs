//! arcade-provision: stage a chroot, cross-build the cabinet software,
//! converge cabinets, tear the chroot down.
//!
//! ```text
//! arcade-provision prepare   --image raspios.img --chroot /srv/pi
//! arcade-provision build     --chroot /srv/pi
//! arcade-provision provision --image raspios.img --chroot /srv/pi [--skip-build]
//! arcade-provision configure --inventory hosts.toml [--group cabinets]
//! arcade-provision teardown  --chroot /srv/pi [--yes]
//! arcade-provision mice      [device]
//! ```
//!
//! Exit codes: 0 success, 2 precondition failure, 1 anything else.

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arcade_provision::build::orchestrator;
use arcade_provision::config::{ProvisionConfig, CONFIG_ENV};
use arcade_provision::connection::LocalConnection;
use arcade_provision::diag::mice;
use arcade_provision::environment::{self, ChrootTarget, PrepareRequest};
use arcade_provision::error::exit_code;
use arcade_provision::fleet::{self, inventory::DEFAULT_GROUP, Inventory};
use arcade_provision::preflight::{self, require_params, require_root};
use arcade_provision::step::RunReport;
use arcade_provision::teardown;

#[derive(Parser)]
#[command(name = "arcade-provision", version, about = "Provision a Raspberry Pi arcade cabinet")]
struct Cli {
    /// Config file (TOML); defaults to the per-user config if present.
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// More output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the image into a chroot, install the shim, bind-mount host filesystems.
    Prepare {
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long)]
        chroot: Option<PathBuf>,
        /// Where to install the shim (overrides the config).
        #[arg(long)]
        shim: Option<PathBuf>,
    },
    /// Cross-build every component inside a prepared chroot.
    Build {
        #[arg(long)]
        chroot: Option<PathBuf>,
        /// Parallel make jobs (default: detected processors).
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// prepare, then build.
    Provision {
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long)]
        chroot: Option<PathBuf>,
        #[arg(long)]
        skip_build: bool,
    },
    /// Converge every cabinet of an inventory group over SSH.
    Configure {
        #[arg(long)]
        inventory: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_GROUP)]
        group: String,
    },
    /// Unmount everything under a chroot and delete it.
    Teardown {
        #[arg(long)]
        chroot: Option<PathBuf>,
        /// Do not ask for confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Echo mouse packets from /dev/input/<device>.
    Mice {
        #[arg(default_value = mice::DEFAULT_DEVICE)]
        device: String,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Mice { device } = &cli.command {
        return mice::watch(device);
    }

    let mut config = ProvisionConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Prepare {
            image,
            chroot,
            shim,
        } => {
            if let Some(shim) = shim {
                config.environment.shim = shim;
            }
            prepare(&config, PrepareRequest { image, chroot }).map(drop)
        }
        Commands::Build { chroot, jobs } => {
            require_params(&[("chroot", chroot.is_some())])?;
            if jobs.is_some() {
                config.build.jobs = jobs;
            }
            let chroot = chroot.unwrap_or_default();
            require_root()?;
            let host = LocalConnection::host();
            let target = ChrootTarget::new(&chroot, &config.environment);
            target.ensure_ready(&host, &config.environment.mount_set(target.root()))?;
            build(&config, &target)
        }
        Commands::Provision {
            image,
            chroot,
            skip_build,
        } => {
            let target = prepare(&config, PrepareRequest { image, chroot })?;
            if skip_build {
                info!("skipping build phase");
                return Ok(());
            }
            build(&config, &target)
        }
        Commands::Configure { inventory, group } => {
            require_params(&[("inventory", inventory.is_some())])?;
            let inventory = Inventory::load(&inventory.unwrap_or_default())?;
            preflight::check_required_tools(preflight::FLEET_TOOLS)?;
            let reports = fleet::configure_group(&config.fleet, &inventory, &group)?;
            for (host, report) in &reports {
                summarize(host, report);
            }
            Ok(())
        }
        Commands::Teardown { chroot, yes } => {
            require_params(&[("chroot", chroot.is_some())])?;
            let chroot = chroot.unwrap_or_default();
            require_root()?;
            let report = teardown::teardown(
                &LocalConnection::host(),
                &config.environment,
                &chroot,
                |question| if yes { Ok(true) } else { teardown::ask(question) },
            )?;
            summarize("teardown", &report);
            Ok(())
        }
        Commands::Mice { .. } => Ok(()),
    }
}

fn prepare(config: &ProvisionConfig, request: PrepareRequest) -> Result<ChrootTarget> {
    let (image, chroot) = request.validate()?;
    require_root()?;
    preflight::check_required_tools(preflight::ENVIRONMENT_TOOLS)?;
    preflight::check_min_version("sfdisk", preflight::SFDISK_MIN_VERSION)?;

    let (target, report) =
        environment::prepare(&LocalConnection::host(), &config.environment, image, chroot)?;
    summarize(&display(target.root()), &report);
    Ok(target)
}

fn build(config: &ProvisionConfig, target: &ChrootTarget) -> Result<()> {
    let report = orchestrator::build_all(&target.connection(), &config.build)?;
    summarize(&display(target.root()), &report);
    Ok(())
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn summarize(target: &str, report: &RunReport) {
    info!(
        target_name = %target,
        steps = report.len(),
        changed = report.changed_steps().len(),
        ignored_failures = report.ignored_failures().len(),
        "done"
    );
    for line in report.lines() {
        println!("{target}  {line}");
    }
}
