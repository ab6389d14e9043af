use super::{archive_path, BundleProvider};
use crate::error::LauncherError;
use crate::model::ServiceInfo;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

/// Downloads bundles from the URL carried in the service metadata.
pub struct HttpProvider {
    client: reqwest::Client,
    downloads: PathBuf,
}

impl HttpProvider {
    pub fn new(downloads: impl Into<PathBuf>) -> Self {
        Self::with_client(reqwest::Client::new(), downloads)
    }

    pub fn with_client(client: reqwest::Client, downloads: impl Into<PathBuf>) -> Self {
        Self {
            client,
            downloads: downloads.into(),
        }
    }
}

#[async_trait]
impl BundleProvider for HttpProvider {
    async fn fetch(&self, info: &ServiceInfo) -> Result<PathBuf, LauncherError> {
        let url = info.download_url.as_deref().ok_or_else(|| {
            LauncherError::Provider(format!("service {} has no download URL", info.id))
        })?;

        debug!(id = %info.id, version = info.version, url, "Download bundle");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LauncherError::Provider(format!("download failed: {e}")))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| LauncherError::Provider(format!("download failed: {e}")))?;

        tokio::fs::create_dir_all(&self.downloads)
            .await
            .map_err(|e| LauncherError::Provider(e.to_string()))?;
        let output = archive_path(&self.downloads, info);
        tokio::fs::write(&output, &body)
            .await
            .map_err(|e| LauncherError::Provider(e.to_string()))?;

        info!(id = %info.id, size = body.len(), "Bundle downloaded");
        Ok(output)
    }
}
