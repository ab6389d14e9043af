//! Bundle providers and archive handling.
//!
//! A [`BundleProvider`] turns cloud metadata into a local gzip'd tar archive.
//! The launcher owns the archive once `fetch` returns: it unpacks it into the
//! services directory and deletes it.
//!
//! Providers are chosen at construction time:
//!
//! - [`HttpProvider`] downloads from [`ServiceInfo::download_url`].
//! - [`LocalProvider`] serves archives (or plain directories) from a fixture directory.

mod archive;
mod http;
mod local;

pub use archive::{pack, remove_bundle, unpack};
pub use http::HttpProvider;
pub use local::LocalProvider;

use crate::error::LauncherError;
use crate::model::ServiceInfo;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait BundleProvider: Send + Sync + 'static {
    /// Produces a local bundle archive for `info`.
    async fn fetch(&self, info: &ServiceInfo) -> Result<PathBuf, LauncherError>;
}

/// Name of the archive file a provider stores for `info` under `dir`.
pub(crate) fn archive_path(dir: &Path, info: &ServiceInfo) -> PathBuf {
    dir.join(format!("{}_v{}.tar.gz", info.id, info.version))
}
