//! Lifecycle state machine for a single service.
//!
//! ```text
//! install:  fetch -> unpack -> configure -> start -> registry write
//! upgrade:  fetch -> unpack -> stop old -> configure -> start -> registry update
//! remove:   stop -> unregister -> teardown bundle -> registry delete
//! ```
//!
//! Every method runs to a terminal outcome. A failed first install leaves no
//! record and no bundle behind. A failed upgrade keeps the old record, flags it
//! with [`ServiceStatus::Error`] and restarts the old unit when it can.
//!
//! [`Lifecycle`] never serializes calls itself; the
//! [`Dispatcher`](crate::dispatcher::Dispatcher) guarantees at most one call
//! per id is in flight.

use crate::bundle::{remove_bundle, unpack, BundleProvider};
use crate::config::Config;
use crate::error::LauncherError;
use crate::model::{
    ActiveUsers, NetworkHints, ServiceInfo, ServiceRecord, ServiceState, ServiceStatus, UserSet,
};
use crate::registry::Registry;
use crate::resolver::{resolve, Resolution};
use crate::runtime::{RuntimeAdapter, RuntimeHandle};
use crate::sweep::{decide, Decision, SweepPass};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Lifecycle {
    registry: Arc<dyn Registry>,
    provider: Arc<dyn BundleProvider>,
    runtime: Arc<dyn RuntimeAdapter>,
    users: Arc<ActiveUsers>,
    services_dir: PathBuf,
    default_ttl: u32,
}

impl Lifecycle {
    pub fn new(
        config: &Config,
        registry: Arc<dyn Registry>,
        provider: Arc<dyn BundleProvider>,
        runtime: Arc<dyn RuntimeAdapter>,
        users: Arc<ActiveUsers>,
    ) -> Self {
        Self {
            registry,
            provider,
            runtime,
            users,
            services_dir: config.services_dir(),
            default_ttl: config.default_service_ttl,
        }
    }

    /// Installs `info`, or upgrades the installed version in place.
    ///
    /// The new service is bound to the users active when the call starts. If
    /// the active set changed meanwhile, the service is left stopped.
    #[tracing::instrument(skip(self, info), fields(id = %info.id, version = info.version))]
    pub async fn install(&self, info: &ServiceInfo) -> Result<(), LauncherError> {
        let active = self.users.get();
        let existing = self.registry.find_service(&info.id).await?;
        let owner = match existing {
            Some(_) => self.registry.service_users(&info.id).await?,
            None => None,
        };

        match resolve(existing.as_ref(), owner.as_ref(), info, &active)? {
            Resolution::Install => self.install_new(info, &active).await?,
            Resolution::Upgrade { current, rebind } => {
                self.upgrade(info, current, owner, rebind).await?
            }
        }

        if self.users.get() != active {
            info!(owner = %active, "Active users changed during install, deactivating");
            self.runtime.stop(&info.id).await?;
            self.registry
                .set_service_state(&info.id, ServiceState::Stopped)
                .await?;
        }
        Ok(())
    }

    /// Removes the service and its binding. Returns the removed version, or
    /// `None` when nothing was installed under `id`.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<Option<u64>, LauncherError> {
        let Some(record) = self.registry.find_service(id).await? else {
            debug!("Not installed, nothing to remove");
            return Ok(None);
        };
        let owner = self.registry.service_users(id).await?;

        if record.state != ServiceState::Stopped {
            if let Err(e) = self.runtime.stop(id).await {
                self.flag_error(id).await;
                return Err(e);
            }
        }
        if let Err(e) = self.runtime.unregister(id).await {
            self.flag_error(id).await;
            return Err(e);
        }
        if let Err(e) = remove_bundle(&record.bundle_path).await {
            warn!(path = %record.bundle_path.display(), error = %e, "Can't remove bundle");
        }

        self.registry.remove_service(id).await?;
        if let Some(owner) = owner {
            self.registry.remove_users_service(&owner, id).await?;
        }

        info!(version = record.version, "Service removed");
        Ok(Some(record.version))
    }

    /// Version currently recorded for `id`, if any.
    pub async fn installed_version(&self, id: &str) -> Option<u64> {
        match self.registry.find_service(id).await {
            Ok(record) => record.map(|r| r.version),
            Err(e) => {
                warn!(id, error = %e, "Can't read service");
                None
            }
        }
    }

    /// Applies the sweep decision for `id` under the active set of `pass`.
    ///
    /// A record that disappeared since the sweep snapshot is reported as
    /// [`Decision::Keep`].
    #[tracing::instrument(skip(self, pass), fields(cold = pass.cold))]
    pub async fn reconcile(&self, id: &str, pass: &SweepPass) -> Result<Decision, LauncherError> {
        let Some(record) = self.registry.find_service(id).await? else {
            return Ok(Decision::Keep);
        };
        let in_scope = self.registry.is_users_service(&pass.users, id).await?;
        let decision = decide(&record, in_scope, pass);

        match decision {
            Decision::Reclaim => {
                info!(ttl_days = record.ttl_days, started_at = %record.started_at, "TTL expired");
                self.remove(id).await?;
            }
            Decision::Start => {
                if let Err(e) = self.runtime.start(&RuntimeHandle::from(&record)).await {
                    self.flag_error(id).await;
                    return Err(e);
                }
                self.registry.set_service_state(id, ServiceState::Running).await?;
                self.registry.set_service_status(id, ServiceStatus::Ok).await?;
                self.registry.set_service_start_time(id, Utc::now()).await?;
                info!("Service started");
            }
            Decision::Stop => {
                if let Err(e) = self.runtime.stop(id).await {
                    self.flag_error(id).await;
                    return Err(e);
                }
                self.registry.set_service_state(id, ServiceState::Stopped).await?;
                info!("Service stopped");
            }
            Decision::Keep => {}
        }
        Ok(decision)
    }

    async fn install_new(&self, info: &ServiceInfo, owner: &UserSet) -> Result<(), LauncherError> {
        let bundle = self.prepare(info).await?;
        let handle = self.activate(info, &bundle).await?;

        self.registry.add_service(self.record(info, handle)).await?;
        self.registry.add_users_service(owner, &info.id).await?;

        info!(%owner, "Service installed");
        Ok(())
    }

    async fn upgrade(
        &self,
        info: &ServiceInfo,
        current: ServiceRecord,
        owner: Option<UserSet>,
        rebind: Option<UserSet>,
    ) -> Result<(), LauncherError> {
        info!(from = current.version, "Upgrading");

        let handle = match self.replace(info, &current).await {
            Ok(handle) => handle,
            Err(e) => {
                self.flag_error(&info.id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.registry.update_service(self.record(info, handle)).await {
            self.flag_error(&info.id).await;
            return Err(e.into());
        }
        if let Some(users) = rebind {
            if let Some(previous) = owner {
                self.registry.remove_users_service(&previous, &info.id).await?;
            }
            self.registry.add_users_service(&users, &info.id).await?;
            info!(owner = %users, "Service rebound");
        }

        if let Err(e) = remove_bundle(&current.bundle_path).await {
            warn!(path = %current.bundle_path.display(), error = %e, "Can't remove old bundle");
        }
        info!("Service upgraded");
        Ok(())
    }

    /// Swaps the running unit of `current` for the bundle of `info`.
    async fn replace(
        &self,
        info: &ServiceInfo,
        current: &ServiceRecord,
    ) -> Result<RuntimeHandle, LauncherError> {
        let bundle = self.prepare(info).await?;

        let was_running = current.state != ServiceState::Stopped;
        if was_running {
            if let Err(e) = self.runtime.stop(&current.id).await {
                discard_bundle(&bundle).await;
                return Err(e);
            }
        }

        match self.activate(info, &bundle).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.restore(current, was_running).await;
                Err(e)
            }
        }
    }

    /// Fetch and unpack. On failure nothing is left on disk.
    async fn prepare(&self, info: &ServiceInfo) -> Result<PathBuf, LauncherError> {
        let archive = self.provider.fetch(info).await?;
        let bundle = self
            .services_dir
            .join(format!("{}_v{}", info.id, info.version));

        let unpacked = unpack(&archive, &bundle).await;
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            warn!(archive = %archive.display(), error = %e, "Can't remove bundle archive");
        }
        if let Err(e) = unpacked {
            discard_bundle(&bundle).await;
            return Err(e);
        }

        debug!(bundle = %bundle.display(), "Bundle unpacked");
        Ok(bundle)
    }

    /// Configure and start. On failure the unit is unregistered and the bundle deleted.
    async fn activate(
        &self,
        info: &ServiceInfo,
        bundle: &Path,
    ) -> Result<RuntimeHandle, LauncherError> {
        let started = async {
            let handle = self
                .runtime
                .configure(&info.id, bundle, &info.permissions, &info.network)
                .await?;
            self.runtime.start(&handle).await?;
            Ok::<_, LauncherError>(handle)
        }
        .await;

        if started.is_err() {
            if let Err(e) = self.runtime.unregister(&info.id).await {
                warn!(error = %e, "Can't unregister unit");
            }
            discard_bundle(bundle).await;
        }
        started
    }

    /// Puts the unit of `current` back after a failed upgrade.
    async fn restore(&self, current: &ServiceRecord, start: bool) {
        let restored = async {
            let handle = self
                .runtime
                .configure(
                    &current.id,
                    &current.bundle_path,
                    &current.permissions,
                    &NetworkHints::default(),
                )
                .await?;
            if start {
                self.runtime.start(&handle).await?;
            }
            Ok::<_, LauncherError>(())
        }
        .await;

        match restored {
            Ok(()) => info!(version = current.version, "Previous version restored"),
            Err(e) => {
                warn!(error = %e, "Can't restore previous version");
                if let Err(e) = self
                    .registry
                    .set_service_state(&current.id, ServiceState::Error)
                    .await
                {
                    warn!(error = %e, "Can't update service state");
                }
            }
        }
    }

    async fn flag_error(&self, id: &str) {
        if let Err(e) = self.registry.set_service_status(id, ServiceStatus::Error).await {
            warn!(id, error = %e, "Can't update service status");
        }
    }

    fn record(&self, info: &ServiceInfo, handle: RuntimeHandle) -> ServiceRecord {
        ServiceRecord {
            id: info.id.clone(),
            version: info.version,
            bundle_path: handle.bundle_path,
            unit_name: handle.unit_name,
            run_user: handle.run_user,
            permissions: info.permissions.clone(),
            state: ServiceState::Running,
            status: ServiceStatus::Ok,
            started_at: Utc::now(),
            ttl_days: info.ttl_days.unwrap_or(self.default_ttl),
        }
    }
}

async fn discard_bundle(bundle: &Path) {
    if let Err(e) = remove_bundle(bundle).await {
        warn!(bundle = %bundle.display(), error = %e, "Can't remove bundle");
    }
}
