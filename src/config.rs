//! Launcher configuration.
//!
//! Loaded from a JSON file; every field has a default so a minimal file such as
//! `{"workingDir": "/var/aos/sm"}` is valid.

use crate::error::ConfigError;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

const DEFAULT_WORKING_DIR: &str = "/var/aos/servicemanager";
const DEFAULT_SERVICE_TTL_DAYS: u32 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Root directory for unpacked bundles and downloads.
    pub working_dir: PathBuf,
    /// SQLite registry file. Defaults to `<working_dir>/servicemanager.db`.
    pub storage_path: Option<PathBuf>,
    /// TTL in days applied to services that don't carry their own.
    pub default_service_ttl: u32,
    /// Serve bundles from this directory instead of downloading them.
    pub fixtures_dir: Option<PathBuf>,
    pub runtime: RuntimeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from(DEFAULT_WORKING_DIR),
            storage_path: None,
            default_service_ttl: DEFAULT_SERVICE_TTL_DAYS,
            fixtures_dir: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Config {
    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Config rooted at `working_dir`, everything else defaulted.
    pub fn with_working_dir(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    pub fn services_dir(&self) -> PathBuf {
        self.working_dir.join("services")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.working_dir.join("downloads")
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage_path
            .clone()
            .unwrap_or_else(|| self.working_dir.join("servicemanager.db"))
    }
}

/// Settings for [`SystemdRuntime`](crate::runtime::SystemdRuntime).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Directory the generated unit files are written to.
    pub unit_dir: PathBuf,
    /// Prefix of every generated unit name.
    pub unit_prefix: String,
    /// OCI runtime binary invoked by the units.
    pub runner: String,
    /// User recorded as the owner of the service process.
    pub run_user: String,
    /// First address handed out to services.
    pub address_pool: Ipv4Addr,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
            unit_prefix: "aos_".to_string(),
            runner: "runc".to_string(),
            run_user: "root".to_string(),
            address_pool: Ipv4Addr::new(172, 19, 0, 2),
        }
    }
}
