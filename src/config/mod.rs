//! The provisioning config file.
//!
//! ```toml
//! [environment]
//! emulator = "/usr/bin/qemu-arm-static"
//!
//! [build]
//! arch_flags = "-mcpu=cortex-a72 -mfpu=neon-fp-armv8 -mfloat-abi=hard -O2"
//!
//! [[build.components]]
//! name = "attract"
//! repo = "https://github.com/mickelson/attract.git"
//! ref = "v2.7.0"
//! system = "make"
//!
//! [fleet]
//! boot_config_url = "https://example.org/config.txt"
//! ```
//!
//! Every section falls back to the cabinet defaults when omitted. Note that
//! listing `[[build.components]]` replaces the default component list.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::build::BuildConfig;
use crate::environment::EnvironmentConfig;
use crate::error::ProvisionError;
use crate::fleet::FleetConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ARCADE_PROVISION_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    pub environment: EnvironmentConfig,
    pub build: BuildConfig,
    pub fleet: FleetConfig,
}

impl ProvisionConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("parsing config")?;
        config.build.validate()?;
        Ok(config)
    }

    /// Load `path`, or the per-user default when it exists, or the defaults.
    ///
    /// An explicitly named file that does not exist is a precondition failure.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) if !path.is_file() => {
                return Err(ProvisionError::precondition(format!(
                    "config file {} does not exist",
                    path.display()
                ))
                .into());
            }
            Some(path) => path.to_path_buf(),
            None => match default_path().filter(|path| path.is_file()) {
                Some(path) => path,
                None => {
                    debug!("no config file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        debug!(path = %path.display(), "loading config");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// `<config dir>/arcade-provision/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("arcade-provision").join("config.toml"))
}
