//! # Test doubles
//!
//! In-process stand-ins for the launcher's external collaborators, so the
//! lifecycle and dispatcher can be exercised without systemd or a network.
//!
//! - [`MockRuntime`] records every call, tracks which units are running and
//!   fails on demand.
//! - [`MockProvider`] builds real bundle archives on the fly, counts fetches
//!   and can be slowed down or made to fail.
//! - [`MockRegistry`] is a [`MemoryRegistry`] whose record writes can be made
//!   to fail per service id.
//!
//! ```ignore
//! let runtime = Arc::new(MockRuntime::new());
//! runtime.fail_start("svc0");
//! // ... install svc0 ...
//! assert!(runtime.calls().contains(&RuntimeCall::Unregister("svc0".into())));
//! ```

use crate::bundle::{pack, BundleProvider};
use crate::error::{LauncherError, RegistryError};
use crate::model::{NetworkHints, ServiceInfo, ServiceRecord, ServiceState, ServiceStatus, UserSet};
use crate::registry::{MemoryRegistry, Registry, RegistryResult};
use crate::runtime::{RuntimeAdapter, RuntimeHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// =============================================================================
// RUNTIME
// =============================================================================

/// One call observed by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Configure(String),
    Start(String),
    Stop(String),
    Unregister(String),
    Reload,
}

#[derive(Default)]
struct RuntimeState {
    calls: Vec<RuntimeCall>,
    configured: HashMap<String, (PathBuf, String)>,
    running: BTreeSet<String>,
    addresses: HashMap<String, Ipv4Addr>,
    fail_start: HashSet<String>,
    fail_stop: HashSet<String>,
    fail_unregister: HashSet<String>,
    fail_configure: HashSet<String>,
}

/// Recording [`RuntimeAdapter`].
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<RuntimeState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `start` of `id` fail.
    pub fn fail_start(&self, id: &str) {
        self.state.lock().fail_start.insert(id.to_string());
    }

    /// Makes `configure` fail for bundles whose directory is named `bundle_name`.
    pub fn fail_configure_bundle(&self, bundle_name: &str) {
        self.state.lock().fail_configure.insert(bundle_name.to_string());
    }

    /// Makes every `stop` of `id` fail. The unit keeps running.
    pub fn fail_stop(&self, id: &str) {
        self.state.lock().fail_stop.insert(id.to_string());
    }

    /// Makes every `unregister` of `id` fail. The unit stays configured.
    pub fn fail_unregister(&self, id: &str) {
        self.state.lock().fail_unregister.insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_start.clear();
        state.fail_stop.clear();
        state.fail_unregister.clear();
        state.fail_configure.clear();
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn reloads(&self) -> usize {
        self.count(|c| *c == RuntimeCall::Reload)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state.lock().running.contains(id)
    }

    /// Ids of the running units, sorted.
    pub fn running(&self) -> Vec<String> {
        self.state.lock().running.iter().cloned().collect()
    }

    /// Permissions passed to the last `configure` of `id`.
    pub fn permissions(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .configured
            .get(id)
            .map(|(_, permissions)| permissions.clone())
    }
}

#[async_trait]
impl RuntimeAdapter for MockRuntime {
    async fn configure(
        &self,
        id: &str,
        bundle: &Path,
        permissions: &str,
        _network: &NetworkHints,
    ) -> Result<RuntimeHandle, LauncherError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Configure(id.to_string()));

        let name = bundle
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if state.fail_configure.contains(&name) {
            return Err(LauncherError::Runtime(format!("simulated configure failure: {name}")));
        }
        if !bundle.join("config.json").is_file() {
            return Err(LauncherError::Runtime(format!(
                "no runtime spec in {}",
                bundle.display()
            )));
        }

        state
            .configured
            .insert(id.to_string(), (bundle.to_path_buf(), permissions.to_string()));
        if !state.addresses.contains_key(id) {
            let base = u32::from(Ipv4Addr::new(172, 19, 0, 2));
            let free = (base..)
                .map(Ipv4Addr::from)
                .find(|a| !state.addresses.values().any(|held| held == a))
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            state.addresses.insert(id.to_string(), free);
        }

        Ok(RuntimeHandle {
            id: id.to_string(),
            unit_name: format!("aos_{id}.service"),
            run_user: "root".to_string(),
            bundle_path: bundle.to_path_buf(),
        })
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), LauncherError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Start(handle.id.clone()));
        if state.fail_start.contains(&handle.id) {
            return Err(LauncherError::Runtime(format!(
                "simulated start failure: {}",
                handle.id
            )));
        }
        state.running.insert(handle.id.clone());
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), LauncherError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Stop(id.to_string()));
        if state.fail_stop.contains(id) {
            return Err(LauncherError::Runtime(format!("simulated stop failure: {id}")));
        }
        state.running.remove(id);
        Ok(())
    }

    async fn unregister(&self, id: &str) -> Result<(), LauncherError> {
        let mut state = self.state.lock();
        state.calls.push(RuntimeCall::Unregister(id.to_string()));
        if state.fail_unregister.contains(id) {
            return Err(LauncherError::Runtime(format!(
                "simulated unregister failure: {id}"
            )));
        }
        state.running.remove(id);
        state.configured.remove(id);
        state.addresses.remove(id);
        Ok(())
    }

    async fn reload(&self) -> Result<(), LauncherError> {
        self.state.lock().calls.push(RuntimeCall::Reload);
        Ok(())
    }

    async fn address(&self, id: &str) -> Result<IpAddr, LauncherError> {
        self.state
            .lock()
            .addresses
            .get(id)
            .map(|a| IpAddr::V4(*a))
            .ok_or_else(|| LauncherError::NotFound(id.to_string()))
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// [`MemoryRegistry`] with injectable write failures.
///
/// Only writes to service records fail; reads and user bindings always go
/// through.
#[derive(Default)]
pub struct MockRegistry {
    inner: MemoryRegistry,
    failing: Mutex<HashSet<String>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every record write for `id` fail with a database error.
    pub fn fail_writes(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    fn check(&self, id: &str) -> RegistryResult<()> {
        if self.failing.lock().contains(id) {
            return Err(RegistryError::Database(format!("simulated write failure: {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn add_service(&self, record: ServiceRecord) -> RegistryResult<()> {
        self.check(&record.id)?;
        self.inner.add_service(record).await
    }

    async fn update_service(&self, record: ServiceRecord) -> RegistryResult<()> {
        self.check(&record.id)?;
        self.inner.update_service(record).await
    }

    async fn remove_service(&self, id: &str) -> RegistryResult<()> {
        self.check(id)?;
        self.inner.remove_service(id).await
    }

    async fn service(&self, id: &str) -> RegistryResult<ServiceRecord> {
        self.inner.service(id).await
    }

    async fn services(&self) -> RegistryResult<Vec<ServiceRecord>> {
        self.inner.services().await
    }

    async fn set_service_state(&self, id: &str, state: ServiceState) -> RegistryResult<()> {
        self.check(id)?;
        self.inner.set_service_state(id, state).await
    }

    async fn set_service_status(&self, id: &str, status: ServiceStatus) -> RegistryResult<()> {
        self.check(id)?;
        self.inner.set_service_status(id, status).await
    }

    async fn set_service_start_time(&self, id: &str, time: DateTime<Utc>) -> RegistryResult<()> {
        self.check(id)?;
        self.inner.set_service_start_time(id, time).await
    }

    async fn add_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<()> {
        self.inner.add_users_service(users, id).await
    }

    async fn remove_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<()> {
        self.inner.remove_users_service(users, id).await
    }

    async fn users_services(&self, users: &UserSet) -> RegistryResult<Vec<ServiceRecord>> {
        self.inner.users_services(users).await
    }

    async fn is_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<bool> {
        self.inner.is_users_service(users, id).await
    }

    async fn users_list(&self) -> RegistryResult<Vec<UserSet>> {
        self.inner.users_list().await
    }

    async fn delete_users(&self, users: &UserSet) -> RegistryResult<()> {
        self.inner.delete_users(users).await
    }
}

// =============================================================================
// BUNDLE PROVIDER
// =============================================================================

#[derive(Default)]
struct ProviderState {
    fetches: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    failing: HashSet<String>,
    delay: Duration,
}

/// [`BundleProvider`] producing a minimal OCI-style bundle for any request.
pub struct MockProvider {
    dir: PathBuf,
    serial: AtomicUsize,
    state: Mutex<ProviderState>,
}

impl MockProvider {
    /// Archives are written under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            serial: AtomicUsize::new(0),
            state: Mutex::default(),
        }
    }

    /// Makes every fetch of `id` fail.
    pub fn fail(&self, id: &str) {
        self.state.lock().failing.insert(id.to_string());
    }

    /// Delays every fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Number of fetches requested for `id`.
    pub fn fetches(&self, id: &str) -> usize {
        self.state.lock().fetches.get(id).copied().unwrap_or(0)
    }

    /// Highest number of concurrent fetches ever observed for `id`.
    pub fn max_in_flight(&self, id: &str) -> usize {
        self.state.lock().max_in_flight.get(id).copied().unwrap_or(0)
    }

    fn enter(&self, id: &str) -> (Duration, bool) {
        let mut state = self.state.lock();
        *state.fetches.entry(id.to_string()).or_default() += 1;
        let in_flight = {
            let count = state.in_flight.entry(id.to_string()).or_default();
            *count += 1;
            *count
        };
        let max = state.max_in_flight.entry(id.to_string()).or_default();
        *max = (*max).max(in_flight);
        (state.delay, state.failing.contains(id))
    }

    fn leave(&self, id: &str) {
        if let Some(count) = self.state.lock().in_flight.get_mut(id) {
            *count -= 1;
        }
    }

    async fn build(&self, info: &ServiceInfo) -> Result<PathBuf, LauncherError> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        let source = self.dir.join(format!("src-{serial}"));
        let archive = self.dir.join(format!("{}_v{}-{serial}.tar.gz", info.id, info.version));

        let spec = serde_json::json!({
            "ociVersion": "1.0.2",
            "process": { "args": ["python3", "/home/service.py"] },
            "annotations": { "service.id": info.id, "service.version": info.version.to_string() },
        });
        let write = async {
            tokio::fs::create_dir_all(source.join("rootfs/home")).await?;
            tokio::fs::write(source.join("config.json"), spec.to_string()).await?;
            tokio::fs::write(source.join("rootfs/home/service.py"), "print('hello')\n").await?;
            pack(&source, &archive).await?;
            tokio::fs::remove_dir_all(&source).await
        };
        write
            .await
            .map_err(|e| LauncherError::Provider(format!("can't build bundle: {e}")))?;
        Ok(archive)
    }
}

#[async_trait]
impl BundleProvider for MockProvider {
    async fn fetch(&self, info: &ServiceInfo) -> Result<PathBuf, LauncherError> {
        let (delay, failing) = self.enter(&info.id);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = if failing {
            Err(LauncherError::Provider(format!(
                "simulated download failure: {}",
                info.id
            )))
        } else {
            self.build(info).await
        };

        self.leave(&info.id);
        result
    }
}
