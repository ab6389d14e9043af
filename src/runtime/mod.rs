//! Runtime adapter: turns an unpacked bundle into a supervised process.
//!
//! The launcher drives every runtime side effect through [`RuntimeAdapter`].
//! [`SystemdRuntime`] is the on-device implementation; tests use
//! [`MockRuntime`](crate::mock::MockRuntime).

mod systemd;

pub use systemd::SystemdRuntime;

use crate::error::LauncherError;
use crate::model::{NetworkHints, ServiceRecord};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// What a configured service needs to be started again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub id: String,
    pub unit_name: String,
    pub run_user: String,
    pub bundle_path: PathBuf,
}

impl From<&ServiceRecord> for RuntimeHandle {
    fn from(record: &ServiceRecord) -> Self {
        Self {
            id: record.id.clone(),
            unit_name: record.unit_name.clone(),
            run_user: record.run_user.clone(),
            bundle_path: record.bundle_path.clone(),
        }
    }
}

#[async_trait]
pub trait RuntimeAdapter: Send + Sync + 'static {
    /// Writes the run configuration for `id` into `bundle` and registers its unit.
    async fn configure(
        &self,
        id: &str,
        bundle: &Path,
        permissions: &str,
        network: &NetworkHints,
    ) -> Result<RuntimeHandle, LauncherError>;

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), LauncherError>;

    async fn stop(&self, id: &str) -> Result<(), LauncherError>;

    /// Deletes the unit registered by [`RuntimeAdapter::configure`]. Unknown ids are ignored.
    async fn unregister(&self, id: &str) -> Result<(), LauncherError>;

    /// Batch reconciliation of the supervisor's unit table.
    async fn reload(&self) -> Result<(), LauncherError>;

    async fn address(&self, id: &str) -> Result<IpAddr, LauncherError>;
}
