//! Cross-building the cabinet's software inside the chroot.
//!
//! This module provides:
//! - [`ComponentSpec`] and [`BuildConfig`] - what to build and how
//! - [`orchestrator`] - the step list: dependencies once, then per component
//!   fetch, configure, build, install
//! - [`stamp`] - build stamps and generated-file snapshots that make
//!   re-runs cheap
//!
//! # Usage
//!
//! ```rust,ignore
//! use arcade_provision::build::{orchestrator, BuildConfig};
//!
//! let chroot = target.connection();
//! let report = orchestrator::build_all(&chroot, &BuildConfig::default())?;
//! ```

pub mod orchestrator;
pub mod stamp;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Raspberry Pi 3 in 32-bit mode.
pub const DEFAULT_ARCH_FLAGS: &str = "-mcpu=cortex-a53 -mfpu=neon-fp-armv8 -mfloat-abi=hard -O2";

/// Placeholder in configure/make arguments replaced by the arch flags.
pub const ARCH_FLAGS_PLACEHOLDER: &str = "{arch_flags}";

/// Prefix every component installs into.
pub const INSTALL_PREFIX: &str = "/usr/local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    /// `./configure && make && make install`
    Autotools,
    /// `cmake -S . -B build`, `cmake --build`, `cmake --install`
    Cmake,
    /// Plain `make`, no configure step.
    Make,
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildSystem::Autotools => write!(f, "autotools"),
            BuildSystem::Cmake => write!(f, "cmake"),
            BuildSystem::Make => write!(f, "make"),
        }
    }
}

/// One third-party project to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentSpec {
    pub name: String,
    pub repo: String,
    /// Branch or tag to check out.
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default = "default_depth")]
    pub depth: u32,
    pub system: BuildSystem,
    /// Packages needed to build or run it.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub configure_args: Vec<String>,
    #[serde(default)]
    pub make_args: Vec<String>,
    /// Replaces the build system's install command (argv, run as root in
    /// the source directory).
    #[serde(default)]
    pub install_command: Option<Vec<String>>,
    /// File (relative to the source directory) that configure regenerates;
    /// its mtime is kept when the content does not change.
    #[serde(default)]
    pub generated_file: Option<String>,
    /// Installs shared libraries: refresh the linker cache afterwards.
    #[serde(default)]
    pub shared_libs: bool,
}

fn default_depth() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Unprivileged identity that fetches and compiles.
    pub user: String,
    /// Directory inside the chroot holding one checkout per component.
    pub source_root: String,
    pub arch_flags: String,
    /// Parallel make jobs; detected processors when unset.
    pub jobs: Option<usize>,
    pub components: Vec<ComponentSpec>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            user: "pi".to_string(),
            source_root: "/home/pi/src".to_string(),
            arch_flags: DEFAULT_ARCH_FLAGS.to_string(),
            jobs: None,
            components: default_components(),
        }
    }
}

impl BuildConfig {
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Every component's dependencies, concatenated in component order.
    pub fn dependencies(&self) -> Vec<String> {
        self.components
            .iter()
            .flat_map(|c| c.dependencies.iter().cloned())
            .collect()
    }

    pub fn source_dir(&self, spec: &ComponentSpec) -> String {
        format!("{}/{}", self.source_root.trim_end_matches('/'), spec.name)
    }

    /// Replace [`ARCH_FLAGS_PLACEHOLDER`] in a configured argument.
    pub fn expand(&self, arg: &str) -> String {
        arg.replace(ARCH_FLAGS_PLACEHOLDER, &self.arch_flags)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for spec in &self.components {
            if spec.name.is_empty() || spec.name.contains('/') {
                bail!("invalid component name {:?}", spec.name);
            }
            if !seen.insert(spec.name.as_str()) {
                bail!("component {} is listed twice", spec.name);
            }
            if spec.install_command.as_ref().is_some_and(|argv| argv.is_empty()) {
                bail!("component {} has an empty install_command", spec.name);
            }
        }
        Ok(())
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// SDL2 with KMS/DRM video, the DRM fork of SFML, MAME and Attract-Mode.
fn default_components() -> Vec<ComponentSpec> {
    vec![
        ComponentSpec {
            name: "SDL2".into(),
            repo: "https://github.com/libsdl-org/SDL.git".into(),
            git_ref: "release-2.26.5".into(),
            depth: 1,
            system: BuildSystem::Autotools,
            dependencies: strings(&[
                "libudev-dev",
                "libasound2-dev",
                "libdbus-1-dev",
                "libdrm-dev",
                "libgbm-dev",
                "libegl1-mesa-dev",
                "libgles2-mesa-dev",
            ]),
            configure_args: strings(&[
                "--disable-video-opengl",
                "--disable-video-x11",
                "--disable-pulseaudio",
                "--disable-esd",
                "--enable-video-kmsdrm",
            ]),
            make_args: Vec::new(),
            install_command: None,
            generated_file: Some("include/SDL_config.h".into()),
            shared_libs: true,
        },
        ComponentSpec {
            name: "sfml-pi".into(),
            repo: "https://github.com/mickelson/sfml-pi.git".into(),
            git_ref: "master".into(),
            depth: 1,
            system: BuildSystem::Cmake,
            dependencies: strings(&[
                "libfreetype6-dev",
                "libjpeg-dev",
                "libflac-dev",
                "libogg-dev",
                "libvorbis-dev",
                "libopenal-dev",
                "libudev-dev",
                "libdrm-dev",
                "libgbm-dev",
            ]),
            configure_args: strings(&["-DSFML_DRM=1", "-DCMAKE_BUILD_TYPE=Release"]),
            make_args: Vec::new(),
            install_command: None,
            generated_file: None,
            shared_libs: true,
        },
        ComponentSpec {
            name: "mame".into(),
            repo: "https://github.com/mamedev/mame.git".into(),
            git_ref: "mame0255".into(),
            depth: 1,
            system: BuildSystem::Make,
            dependencies: strings(&["libfontconfig1-dev", "libsdl2-ttf-dev", "python3"]),
            configure_args: Vec::new(),
            make_args: strings(&[
                "NOWERROR=1",
                "NO_X11=1",
                "NO_USE_XINPUT=1",
                "USE_QTDEBUG=0",
                "ARCHOPTS={arch_flags}",
            ]),
            install_command: Some(strings(&["install", "-m", "0755", "mame", "/usr/local/bin/mame"])),
            generated_file: None,
            shared_libs: false,
        },
        ComponentSpec {
            name: "attract".into(),
            repo: "https://github.com/mickelson/attract.git".into(),
            git_ref: "v2.7.0".into(),
            depth: 1,
            system: BuildSystem::Make,
            dependencies: strings(&[
                "libavformat-dev",
                "libavcodec-dev",
                "libavutil-dev",
                "libswscale-dev",
                "libswresample-dev",
                "libfreetype6-dev",
                "libjpeg-dev",
                "libopenal-dev",
                "libcurl4-openssl-dev",
            ]),
            configure_args: Vec::new(),
            make_args: strings(&["USE_DRM=1", "USE_MMAL=1"]),
            install_command: None,
            generated_file: None,
            shared_libs: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BuildConfig::default();
        config.validate().unwrap();
        assert_eq!(config.components.len(), 4);
        assert_eq!(config.arch_flags, DEFAULT_ARCH_FLAGS);
    }

    #[test]
    fn test_dependencies_keep_duplicates_in_order() {
        let deps = BuildConfig::default().dependencies();
        assert_eq!(deps.first().map(String::as_str), Some("libudev-dev"));
        assert_eq!(deps.iter().filter(|d| *d == "libudev-dev").count(), 2);
    }

    #[test]
    fn test_jobs_has_a_floor_of_one() {
        let config = BuildConfig {
            jobs: Some(0),
            ..BuildConfig::default()
        };
        assert_eq!(config.jobs(), 1);
        assert!(BuildConfig::default().jobs() >= 1);
    }

    #[test]
    fn test_expand_arch_flags() {
        let config = BuildConfig::default();
        assert_eq!(
            config.expand("ARCHOPTS={arch_flags}"),
            format!("ARCHOPTS={}", DEFAULT_ARCH_FLAGS)
        );
        assert_eq!(config.source_dir(&config.components[2]), "/home/pi/src/mame");
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = BuildConfig::default();
        let first = config.components[0].clone();
        config.components.push(first);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_from_toml() {
        let spec: ComponentSpec = toml::from_str(
            r#"
            name = "SDL2"
            repo = "https://github.com/libsdl-org/SDL.git"
            ref = "release-2.26.5"
            system = "autotools"
            generated_file = "include/SDL_config.h"
            shared_libs = true
            "#,
        )
        .unwrap();
        assert_eq!(spec.depth, 1);
        assert_eq!(spec.system, BuildSystem::Autotools);
        assert!(spec.configure_args.is_empty());

        let bad: Result<ComponentSpec, _> = toml::from_str(
            r#"
            name = "x"
            repo = "r"
            ref = "main"
            system = "autotools"
            shared_lib = true
            "#,
        );
        assert!(bad.is_err());
    }
}
