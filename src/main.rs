//! # service-launcher
//!
//! Runs the launcher against the on-device SQLite registry and systemd.
//!
//! ```bash
//! service-launcher /etc/aos/launcher.json user1 user2
//! ```
//!
//! The user list becomes the active user set; installed services are swept
//! against it at startup. Status events are logged until Ctrl-C.

use service_launcher::bundle::{BundleProvider, HttpProvider, LocalProvider};
use service_launcher::config::Config;
use service_launcher::launcher::{setup_tracing, Launcher};
use service_launcher::model::UserSet;
use service_launcher::registry::SqliteRegistry;
use service_launcher::runtime::SystemdRuntime;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .ok_or_else(|| "usage: service-launcher <config.json> [user ...]".to_string())?;
    let users = UserSet::new(args);

    let config = Config::load(&config_path).map_err(|e| e.to_string())?;
    info!(config = %config_path, working_dir = %config.working_dir.display(), "Config loaded");

    let registry = SqliteRegistry::open(config.storage_path())
        .await
        .map_err(|e| e.to_string())?;
    info!(path = %registry.path().display(), "Registry opened");
    let provider: Arc<dyn BundleProvider> = match &config.fixtures_dir {
        Some(fixtures) => Arc::new(LocalProvider::new(fixtures, config.downloads_dir())),
        None => Arc::new(HttpProvider::new(config.downloads_dir())),
    };
    let runtime = SystemdRuntime::new(config.runtime.clone()).await;

    let (launcher, mut status) =
        Launcher::new(&config, Arc::new(registry), provider, Arc::new(runtime));

    // Drain status events for the whole run
    let reporter = tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            match &event.error {
                None => info!(id = %event.id, version = event.version, action = ?event.action, "Status OK"),
                Some(e) => warn!(id = %event.id, version = event.version, action = ?event.action, error = %e, "Status Error"),
            }
        }
    });

    match launcher.set_users(users).await {
        Ok(report) => info!(?report, "Initial sweep done"),
        Err(e) => error!(error = %e, "Initial sweep failed"),
    }

    for service in launcher.services().await.map_err(|e| e.to_string())? {
        info!(id = %service.id, version = service.version, status = %service.status, "Installed");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Can't listen for shutdown signal");
    }

    launcher.close().await;
    if let Err(e) = reporter.await {
        error!("Status reporter failed: {:?}", e);
        return Err(format!("Status reporter failed: {:?}", e));
    }
    Ok(())
}
