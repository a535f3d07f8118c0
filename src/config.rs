//! Configuration file parsing for vpcctl
//!
//! Parses an optional `vpcctl.toml` using serde. Every setting has a
//! built-in default and can be overridden from the command line.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file consulted when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpcctl/vpcctl.toml";

/// Load configuration from a file
pub fn load(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// Load an explicit config file, or the default one if it exists
///
/// An explicitly requested file must exist; a missing default file just
/// means built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Topology state file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Host uplink used for NAT when `create-vpc` gets no `--interface`
    #[serde(default = "default_interface")]
    pub default_interface: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            default_interface: default_interface(),
        }
    }
}

fn default_state_file() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"));
    home.join(".vpcctl").join("vpcs.json")
}

fn default_interface() -> String {
    "eth0".into()
}
