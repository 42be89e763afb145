//! Provisioning for a Raspberry Pi arcade cabinet.
//!
//! Four phases, run strictly in order, each an ordered list of guarded
//! idempotent steps:
//!
//! - **Environment** - extract a Raspberry Pi OS image into a chroot, install
//!   the emulator shim, bind host filesystems in
//! - **Build** - cross-build SDL2, SFML, MAME and Attract-Mode inside the chroot
//! - **Fleet** - converge cabinets over SSH: system edits, packages, data
//!   layout, config upserts, services, first-run romlists
//! - **Teardown** - unmount and delete a chroot
//!
//! # Architecture
//!
//! ```text
//! bin/arcade-provision (clap)
//!     │
//!     ├── preflight ────── privilege, parameters, host tools
//!     ├── config ──────── TOML: [environment] [build] [fleet]
//!     │
//!     ├── environment ─┐
//!     ├── build ───────┼── Vec<Step> ── step::run_steps ── executor ── Connection
//!     ├── fleet ───────┤                                               ├── LocalConnection
//!     └── teardown ────┘                                               ├── ChrootConnection
//!                                                                      └── SshConnection
//! ```
//!
//! Re-running any phase with unchanged inputs changes nothing; the guards on
//! each step make finished work a no-op, so re-running is also how a failed
//! run is recovered.

pub mod build;
pub mod config;
pub mod connection;
pub mod diag;
pub mod environment;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod preflight;
pub mod process;
pub mod step;
pub mod teardown;

pub use connection::Connection;
pub use error::ProvisionError;
pub use process::{Cmd, ExecContext};
pub use step::{Phase, RunReport, Step};
