//! Binding configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{RadosError, Result};
use crate::native::sim::SimConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Cluster session settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulated backend settings.
    #[serde(default)]
    pub sim: SimConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }
}

impl FromStr for Config {
    type Err = RadosError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Cluster handle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster name, normally "ceph".
    #[serde(default = "ClusterConfig::default_name")]
    pub name: String,

    /// Fully qualified client name.
    #[serde(default = "ClusterConfig::default_user")]
    pub user: String,

    /// Flags passed to cluster handle creation.
    #[serde(default)]
    pub flags: u64,

    /// ceph.conf-style file applied before `options`.
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// Individual configuration options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            user: Self::default_user(),
            flags: 0,
            config_file: None,
            options: BTreeMap::new(),
        }
    }
}

impl ClusterConfig {
    fn default_name() -> String {
        "ceph".to_string()
    }

    fn default_user() -> String {
        "client.admin".to_string()
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "LoggingConfig::default_true")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default = "LoggingConfig::default_true")]
    pub target: bool,

    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_true() -> bool {
        true
    }
}
