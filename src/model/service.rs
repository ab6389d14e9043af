//! Service metadata as delivered by the cloud, and the persisted service record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Optional network shaping hints, in kbit/s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkHints {
    pub upload: Option<u64>,
    pub download: Option<u64>,
}

/// Install request metadata received from the cloud controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInfo {
    pub id: String,
    pub version: u64,
    /// Where network providers download the bundle from.
    pub download_url: Option<String>,
    /// Opaque access-control descriptor, e.g. `{"*": "rw"}`.
    pub permissions: String,
    pub network: NetworkHints,
    /// Overrides the configured default TTL.
    pub ttl_days: Option<u32>,
}

impl ServiceInfo {
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
            ..Default::default()
        }
    }

    pub fn with_permissions(mut self, permissions: impl Into<String>) -> Self {
        self.permissions = permissions.into();
        self
    }

    pub fn with_network(mut self, upload: Option<u64>, download: Option<u64>) -> Self {
        self.network = NetworkHints { upload, download };
        self
    }

    pub fn with_ttl_days(mut self, ttl_days: u32) -> Self {
        self.ttl_days = Some(ttl_days);
        self
    }
}

/// Last known lifecycle state of an installed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Init,
    Running,
    Stopped,
    Error,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Init => "init",
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Error => "error",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(ServiceState::Init),
            "running" => Ok(ServiceState::Running),
            "stopped" => Ok(ServiceState::Stopped),
            "error" => Ok(ServiceState::Error),
            other => Err(format!("unknown service state: {other}")),
        }
    }
}

/// Outcome of the last operation performed on a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Ok,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Ok => "OK",
            ServiceStatus::Error => "Error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(ServiceStatus::Ok),
            "Error" => Ok(ServiceStatus::Error),
            other => Err(format!("unknown service status: {other}")),
        }
    }
}

/// One installed service, as stored in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub id: String,
    pub version: u64,
    /// Unpacked bundle directory, owned by the launcher.
    pub bundle_path: PathBuf,
    pub unit_name: String,
    pub run_user: String,
    pub permissions: String,
    pub state: ServiceState,
    pub status: ServiceStatus,
    /// Time of the last successful start.
    pub started_at: DateTime<Utc>,
    pub ttl_days: u32,
}

impl ServiceRecord {
    /// Returns true once the service has not been started for longer than its TTL.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.started_at) > Duration::days(i64::from(self.ttl_days))
    }
}

/// Entry returned by [`Launcher::services`](crate::launcher::Launcher::services).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSummary {
    pub id: String,
    pub version: u64,
    pub status: ServiceStatus,
}

impl From<&ServiceRecord> for ServiceSummary {
    fn from(record: &ServiceRecord) -> Self {
        Self {
            id: record.id.clone(),
            version: record.version,
            status: record.status,
        }
    }
}
