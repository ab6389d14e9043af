use super::{archive_path, pack, BundleProvider};
use crate::error::LauncherError;
use crate::model::ServiceInfo;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Serves bundles from a local fixture directory.
///
/// For a request `(id, version)` the provider looks, in order, for
/// `<root>/<id>_v<version>.tar.gz`, `<root>/<id>.tar.gz` and a plain directory
/// `<root>/<id>` (packed on the fly). The result is copied into `downloads`
/// so the caller may delete it.
pub struct LocalProvider {
    root: PathBuf,
    downloads: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>, downloads: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            downloads: downloads.into(),
        }
    }
}

#[async_trait]
impl BundleProvider for LocalProvider {
    async fn fetch(&self, info: &ServiceInfo) -> Result<PathBuf, LauncherError> {
        let output = archive_path(&self.downloads, info);
        tokio::fs::create_dir_all(&self.downloads)
            .await
            .map_err(|e| LauncherError::Provider(e.to_string()))?;

        let versioned = archive_path(&self.root, info);
        let unversioned = self.root.join(format!("{}.tar.gz", info.id));
        let directory = self.root.join(&info.id);

        if let Some(source) = [versioned, unversioned].into_iter().find(|p| p.is_file()) {
            debug!(id = %info.id, source = %source.display(), "Copy fixture archive");
            tokio::fs::copy(&source, &output)
                .await
                .map_err(|e| LauncherError::Provider(e.to_string()))?;
        } else if directory.is_dir() {
            debug!(id = %info.id, source = %directory.display(), "Pack fixture directory");
            pack(&directory, &output)
                .await
                .map_err(|e| LauncherError::Provider(e.to_string()))?;
        } else {
            return Err(LauncherError::Provider(format!(
                "no fixture for service {} version {} in {}",
                info.id,
                info.version,
                self.root.display()
            )));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_fixture_is_packed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fixtures");
        std::fs::create_dir_all(root.join("svc0/rootfs")).unwrap();
        std::fs::write(root.join("svc0/config.json"), "{}").unwrap();

        let provider = LocalProvider::new(&root, dir.path().join("downloads"));
        let archive = provider.fetch(&ServiceInfo::new("svc0", 2)).await.unwrap();

        assert!(archive.ends_with("svc0_v2.tar.gz"));
        assert!(archive.is_file());
    }

    #[tokio::test]
    async fn test_versioned_archive_wins() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fixtures");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("svc0_v3.tar.gz"), "v3").unwrap();
        std::fs::write(root.join("svc0.tar.gz"), "any").unwrap();

        let provider = LocalProvider::new(&root, dir.path().join("downloads"));
        let archive = provider.fetch(&ServiceInfo::new("svc0", 3)).await.unwrap();
        assert_eq!(std::fs::read_to_string(archive).unwrap(), "v3");

        let archive = provider.fetch(&ServiceInfo::new("svc0", 4)).await.unwrap();
        assert_eq!(std::fs::read_to_string(archive).unwrap(), "any");
    }

    #[tokio::test]
    async fn test_missing_fixture_is_a_provider_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path(), dir.path().join("downloads"));

        let err = provider.fetch(&ServiceInfo::new("ghost", 0)).await.unwrap_err();
        assert!(matches!(err, LauncherError::Provider(_)));
    }
}
