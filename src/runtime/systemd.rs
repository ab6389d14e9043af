use super::{RuntimeAdapter, RuntimeHandle};
use crate::config::RuntimeConfig;
use crate::error::LauncherError;
use crate::model::NetworkHints;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const PERMISSIONS_ANNOTATION: &str = "aos.vis.permissions";
const UPLOAD_ANNOTATION: &str = "aos.network.upload";
const DOWNLOAD_ANNOTATION: &str = "aos.network.download";
const ADDRESS_ANNOTATION: &str = "aos.network.address";

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs services as systemd units wrapping an OCI runtime.
///
/// `configure` patches the bundle's `config.json` with the permission and
/// network annotations, hands out an address from the pool and writes
/// `<unitDir>/<unitPrefix><id>.service`. Lifecycle calls shell out to `systemctl`.
///
/// Unit files and annotations outlive the process. [`SystemdRuntime::new`]
/// reads them back, so addresses stay stable across restarts.
pub struct SystemdRuntime {
    config: RuntimeConfig,
    systemctl: String,
    addresses: Mutex<AddressPool>,
}

impl SystemdRuntime {
    pub async fn new(config: RuntimeConfig) -> Self {
        let addresses = Mutex::new(AddressPool::new(config.address_pool));
        let runtime = Self {
            config,
            systemctl: "systemctl".to_string(),
            addresses,
        };
        runtime.recover_addresses().await;
        runtime
    }

    /// Replaces the `systemctl` binary, e.g. with a no-op for dry runs.
    pub fn with_systemctl(mut self, program: impl Into<String>) -> Self {
        self.systemctl = program.into();
        self
    }

    fn unit_name(&self, id: &str) -> String {
        format!("{}{}.service", self.config.unit_prefix, id)
    }

    fn unit_path(&self, id: &str) -> PathBuf {
        self.config.unit_dir.join(self.unit_name(id))
    }

    /// Re-registers the address of every unit left by an earlier run.
    async fn recover_addresses(&self) {
        let mut entries = match tokio::fs::read_dir(&self.config.unit_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(dir = %self.config.unit_dir.display(), error = %e, "Can't scan unit dir");
                return;
            }
        };

        let mut recovered = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Can't scan unit dir");
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name
                .strip_prefix(&self.config.unit_prefix)
                .and_then(|rest| rest.strip_suffix(".service"))
            else {
                continue;
            };
            match self.recorded_address(id, &entry.path()).await {
                Ok(address) => recovered.push((id.to_string(), address)),
                Err(e) => warn!(id, error = %e, "Can't recover service address"),
            }
        }

        let count = recovered.len();
        let mut pool = self.addresses.lock();
        for (id, address) in recovered {
            pool.hold(id, address);
        }
        if count > 0 {
            info!(services = count, "Service addresses recovered");
        }
    }

    /// Address annotation of the bundle the unit at `unit_path` runs.
    async fn recorded_address(
        &self,
        id: &str,
        unit_path: &Path,
    ) -> Result<Ipv4Addr, LauncherError> {
        let unit = tokio::fs::read_to_string(unit_path)
            .await
            .map_err(|e| LauncherError::Runtime(e.to_string()))?;
        let exec_start = format!("ExecStart={} run --bundle ", self.config.runner);
        let suffix = format!(" {id}");
        let bundle = unit
            .lines()
            .find_map(|line| line.strip_prefix(&exec_start)?.strip_suffix(&suffix))
            .ok_or_else(|| {
                LauncherError::Runtime(format!("no bundle in {}", unit_path.display()))
            })?;

        let spec = read_spec(&Path::new(bundle).join("config.json")).await?;
        spec.pointer(&format!("/annotations/{ADDRESS_ANNOTATION}"))
            .and_then(Value::as_str)
            .and_then(|address| address.parse().ok())
            .ok_or_else(|| LauncherError::Runtime(format!("bundle {bundle} has no address")))
    }

    fn unit_file(&self, id: &str, bundle: &Path) -> String {
        format!(
            "[Unit]\n\
             Description=AOS service {id}\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={runner} run --bundle {bundle} {id}\n\
             ExecStopPost={runner} delete -f {id}\n\
             Restart=always\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            runner = self.config.runner,
            bundle = bundle.display(),
        )
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(), LauncherError> {
        let cmd_str = format!("{} {}", self.systemctl, args.join(" "));
        debug!(command = %cmd_str, "Run");

        let output = tokio::time::timeout(
            SYSTEMCTL_TIMEOUT,
            tokio::process::Command::new(&self.systemctl).args(args).output(),
        )
        .await
        .map_err(|_| LauncherError::Runtime(format!("{cmd_str} timed out")))?
        .map_err(|e| LauncherError::Runtime(format!("can't run {cmd_str}: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(LauncherError::Runtime(format!(
                "{cmd_str} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl RuntimeAdapter for SystemdRuntime {
    async fn configure(
        &self,
        id: &str,
        bundle: &Path,
        permissions: &str,
        network: &NetworkHints,
    ) -> Result<RuntimeHandle, LauncherError> {
        let address = self.addresses.lock().assign(id)?;

        let spec_path = bundle.join("config.json");
        let mut spec = read_spec(&spec_path).await?;
        annotate(&mut spec, permissions, network, address)?;
        let patched = serde_json::to_vec_pretty(&spec)
            .map_err(|e| LauncherError::Runtime(e.to_string()))?;
        tokio::fs::write(&spec_path, patched)
            .await
            .map_err(|e| LauncherError::Runtime(e.to_string()))?;

        tokio::fs::create_dir_all(&self.config.unit_dir)
            .await
            .map_err(|e| LauncherError::Runtime(e.to_string()))?;
        let unit_path = self.unit_path(id);
        tokio::fs::write(&unit_path, self.unit_file(id, bundle))
            .await
            .map_err(|e| LauncherError::Runtime(e.to_string()))?;
        self.systemctl(&["daemon-reload"]).await?;

        info!(id, unit = %unit_path.display(), %address, "Unit configured");
        Ok(RuntimeHandle {
            id: id.to_string(),
            unit_name: self.unit_name(id),
            run_user: self.config.run_user.clone(),
            bundle_path: bundle.to_path_buf(),
        })
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), LauncherError> {
        self.systemctl(&["start", &handle.unit_name]).await
    }

    async fn stop(&self, id: &str) -> Result<(), LauncherError> {
        self.systemctl(&["stop", &self.unit_name(id)]).await
    }

    async fn unregister(&self, id: &str) -> Result<(), LauncherError> {
        self.addresses.lock().release(id);
        match tokio::fs::remove_file(self.unit_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(id, "Unit file already gone");
                Ok(())
            }
            Err(e) => Err(LauncherError::Runtime(e.to_string())),
        }
    }

    async fn reload(&self) -> Result<(), LauncherError> {
        self.systemctl(&["daemon-reload"]).await
    }

    async fn address(&self, id: &str) -> Result<IpAddr, LauncherError> {
        self.addresses
            .lock()
            .get(id)
            .map(IpAddr::V4)
            .ok_or_else(|| LauncherError::NotFound(id.to_string()))
    }
}

async fn read_spec(path: &Path) -> Result<Value, LauncherError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| LauncherError::Runtime(format!("can't read {}: {e}", path.display())))?;
    serde_json::from_slice(&raw)
        .map_err(|e| LauncherError::Runtime(format!("invalid runtime spec: {e}")))
}

fn annotate(
    spec: &mut Value,
    permissions: &str,
    network: &NetworkHints,
    address: Ipv4Addr,
) -> Result<(), LauncherError> {
    let root = spec
        .as_object_mut()
        .ok_or_else(|| LauncherError::Runtime("runtime spec is not an object".into()))?;
    let annotations = root
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| LauncherError::Runtime("spec annotations is not an object".into()))?;

    if !permissions.is_empty() {
        annotations.insert(PERMISSIONS_ANNOTATION.into(), permissions.into());
    }
    if let Some(upload) = network.upload {
        annotations.insert(UPLOAD_ANNOTATION.into(), upload.to_string().into());
    }
    if let Some(download) = network.download {
        annotations.insert(DOWNLOAD_ANNOTATION.into(), download.to_string().into());
    }
    annotations.insert(ADDRESS_ANNOTATION.into(), address.to_string().into());
    Ok(())
}

/// Hands out IPv4 addresses from `base` up to the end of its /24, one per
/// service id. The lowest free address is always taken first.
struct AddressPool {
    base: u32,
    last: u32,
    assigned: HashMap<String, Ipv4Addr>,
}

impl AddressPool {
    fn new(base: Ipv4Addr) -> Self {
        let base = u32::from(base);
        Self {
            base,
            // .255 is the broadcast address
            last: (base | 0xff) - 1,
            assigned: HashMap::new(),
        }
    }

    /// Returns the address already held by `id`, or the lowest free one.
    fn assign(&mut self, id: &str) -> Result<Ipv4Addr, LauncherError> {
        if let Some(address) = self.assigned.get(id) {
            return Ok(*address);
        }
        let address = (self.base..=self.last)
            .map(Ipv4Addr::from)
            .find(|candidate| !self.assigned.values().any(|held| held == candidate))
            .ok_or_else(|| LauncherError::Runtime("address pool exhausted".into()))?;
        self.assigned.insert(id.to_string(), address);
        Ok(address)
    }

    /// Registers an address assigned by an earlier run.
    fn hold(&mut self, id: String, address: Ipv4Addr) {
        self.assigned.insert(id, address);
    }

    fn release(&mut self, id: &str) {
        self.assigned.remove(id);
    }

    fn get(&self, id: &str) -> Option<Ipv4Addr> {
        self.assigned.get(id).copied()
    }
}
