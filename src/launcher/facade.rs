use crate::bundle::BundleProvider;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, StatusReceiver};
use crate::error::LauncherError;
use crate::lifecycle::Lifecycle;
use crate::model::{ActiveUsers, ServiceInfo, ServiceSummary, UserSet};
use crate::registry::Registry;
use crate::runtime::RuntimeAdapter;
use crate::sweep::{self, SweepPass, SweepReport};
use chrono::Utc;
use futures::future::join_all;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Launcher {
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn RuntimeAdapter>,
    users: Arc<ActiveUsers>,
    dispatcher: Dispatcher,
    /// Serializes sweeps and bulk removal against each other.
    bulk: tokio::sync::Mutex<()>,
    /// Set once the first sweep has run.
    swept: AtomicBool,
}

impl Launcher {
    /// Builds a launcher and returns the receiver of its status events.
    ///
    /// The active user set starts empty; call [`Launcher::set_users`] once the
    /// identity source reports the real one.
    pub fn new(
        config: &Config,
        registry: Arc<dyn Registry>,
        provider: Arc<dyn BundleProvider>,
        runtime: Arc<dyn RuntimeAdapter>,
    ) -> (Self, StatusReceiver) {
        let users = Arc::new(ActiveUsers::default());
        let lifecycle = Lifecycle::new(
            config,
            registry.clone(),
            provider,
            runtime.clone(),
            users.clone(),
        );
        let (dispatcher, status) = Dispatcher::new(Arc::new(lifecycle));

        info!(working_dir = %config.working_dir.display(), "Launcher created");
        let launcher = Self {
            registry,
            runtime,
            users,
            dispatcher,
            bulk: tokio::sync::Mutex::new(()),
            swept: AtomicBool::new(false),
        };
        (launcher, status)
    }

    /// Accepts an install request. The outcome arrives as a status event.
    #[tracing::instrument(skip(self, info), fields(id = %info.id, version = info.version))]
    pub fn install(&self, info: ServiceInfo) -> Result<(), LauncherError> {
        info!("Install requested");
        self.dispatcher.submit_install(info)
    }

    /// Accepts a remove request. The outcome arrives as a status event.
    #[tracing::instrument(skip(self))]
    pub fn remove(&self, id: &str) -> Result<(), LauncherError> {
        info!("Remove requested");
        self.dispatcher.submit_remove(id)
    }

    /// Makes `users` the active user set and sweeps the installed services.
    ///
    /// Returns once every service has been started, stopped or reclaimed. The
    /// first call after [`Launcher::new`] starts every service of `users`
    /// whatever state the registry recorded for it.
    #[tracing::instrument(skip(self, users), fields(users = %users))]
    pub async fn set_users(&self, users: UserSet) -> Result<SweepReport, LauncherError> {
        let _bulk = self.bulk.lock().await;
        let previous = self.users.replace(users.clone());
        if previous != users {
            info!(%previous, "Active users changed");
        }

        let mut pass = SweepPass::new(users, Utc::now());
        if !self.swept.swap(true, Ordering::SeqCst) {
            pass = pass.cold();
        }
        sweep::sweep(
            &self.dispatcher,
            self.registry.as_ref(),
            self.runtime.as_ref(),
            &pass,
        )
        .await
    }

    pub fn users(&self) -> UserSet {
        self.users.get()
    }

    /// Every installed service with its last operation status.
    pub async fn services(&self) -> Result<Vec<ServiceSummary>, LauncherError> {
        let records = self.registry.services().await?;
        Ok(records.iter().map(ServiceSummary::from).collect())
    }

    /// Network address of an installed service.
    pub async fn service_address(&self, id: &str) -> Result<IpAddr, LauncherError> {
        self.registry.service(id).await?;
        self.runtime.address(id).await
    }

    /// Removes every installed service and every user binding.
    ///
    /// Fails with [`LauncherError::Consistency`] if a record survives.
    #[tracing::instrument(skip(self))]
    pub async fn remove_all(&self) -> Result<(), LauncherError> {
        let _bulk = self.bulk.lock().await;
        let records = self.registry.services().await?;
        info!(services = records.len(), "Removing all services");

        let mut pending = Vec::with_capacity(records.len());
        for record in &records {
            pending.push(self.dispatcher.teardown(&record.id)?);
        }
        for (record, outcome) in records.iter().zip(join_all(pending).await) {
            if let Err(e) = outcome.unwrap_or(Err(LauncherError::WorkerDropped)) {
                warn!(id = %record.id, error = %e, "Can't remove service");
            }
        }

        self.runtime.reload().await?;

        let residual = self.registry.services().await?;
        if !residual.is_empty() {
            let ids: Vec<&str> = residual.iter().map(|r| r.id.as_str()).collect();
            return Err(LauncherError::Consistency(format!(
                "services left after remove all: {}",
                ids.join(", ")
            )));
        }

        for users in self.registry.users_list().await? {
            self.registry.delete_users(&users).await?;
        }
        info!("All services removed");
        Ok(())
    }

    /// Stops accepting requests and waits for queued operations to finish.
    ///
    /// The status receiver yields `None` once every event has been read.
    pub async fn close(self) {
        info!("Shutting down launcher...");
        self.dispatcher.close().await;
        info!("Launcher shutdown complete.");
    }
}
