//! Cabinet inventory.
//!
//! ```toml
//! [groups.cabinets]
//! hosts = [
//!     { name = "arcade1", address = "192.168.1.50" },
//!     { name = "arcade2", user = "arcade", port = 2222 },
//! ]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::ProvisionError;

/// Group used when none is named.
pub const DEFAULT_GROUP: &str = "cabinets";

/// One cabinet reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    pub name: String,
    /// Address to connect to; the name itself when unset.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_user() -> String {
    "pi".to_string()
}

fn default_port() -> u16 {
    22
}

impl Host {
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Group {
    #[serde(default)]
    pub hosts: Vec<Host>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
}

impl Inventory {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing inventory")
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ProvisionError::precondition(format!(
                "inventory {} does not exist",
                path.display()
            ))
            .into());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading inventory {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Hosts of `name`; an unknown group is a precondition failure.
    pub fn group(&self, name: &str) -> Result<&[Host]> {
        match self.groups.get(name) {
            Some(group) => Ok(&group.hosts),
            None => {
                let known: Vec<&str> = self.groups.keys().map(String::as_str).collect();
                Err(ProvisionError::precondition(format!(
                    "unknown inventory group '{}' (known: {})",
                    name,
                    if known.is_empty() {
                        "none".to_string()
                    } else {
                        known.join(", ")
                    }
                ))
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_precondition;
    use tempfile::TempDir;

    const INVENTORY: &str = r#"
        [groups.cabinets]
        hosts = [
            { name = "arcade1", address = "192.168.1.50" },
            { name = "arcade2", user = "arcade", port = 2222 },
        ]

        [groups.bartop]
        hosts = []
    "#;

    #[test]
    fn test_parse_applies_host_defaults() {
        let inventory = Inventory::parse(INVENTORY).unwrap();
        let hosts = inventory.group("cabinets").unwrap();

        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].address(), "192.168.1.50");
        assert_eq!(hosts[0].user, "pi");
        assert_eq!(hosts[0].port, 22);
        assert_eq!(hosts[1].address(), "arcade2");
        assert_eq!(hosts[1].port, 2222);
        assert!(inventory.group("bartop").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_group_is_precondition() {
        let inventory = Inventory::parse(INVENTORY).unwrap();
        let err = inventory.group("cocktail").unwrap_err();

        assert!(is_precondition(&err));
        assert!(err.to_string().contains("bartop, cabinets"));
    }

    #[test]
    fn test_rejects_unknown_host_fields() {
        let bad = r#"
            [groups.cabinets]
            hosts = [{ name = "arcade1", hostname = "x" }]
        "#;
        assert!(Inventory::parse(bad).is_err());
    }

    #[test]
    fn test_missing_inventory_is_precondition() {
        let temp = TempDir::new().unwrap();
        let err = Inventory::load(&temp.path().join("hosts.toml")).unwrap_err();
        assert!(is_precondition(&err));
    }
}
