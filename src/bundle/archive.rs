use crate::error::LauncherError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tar::Archive;

/// Unpacks a gzip'd tar `archive` into `dest`, replacing anything already there.
pub async fn unpack(archive: &Path, dest: &Path) -> Result<(), LauncherError> {
    let archive: PathBuf = archive.to_path_buf();
    let dest: PathBuf = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> io::Result<()> {
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        std::fs::create_dir_all(&dest)?;
        Archive::new(GzDecoder::new(File::open(&archive)?)).unpack(&dest)
    })
    .await
    .map_err(|e| LauncherError::Provider(format!("unpack task failed: {e}")))?
    .map_err(|e| LauncherError::Provider(format!("can't unpack bundle: {e}")))
}

/// Packs the content of `source` into a gzip'd tar `archive`.
pub async fn pack(source: &Path, archive: &Path) -> io::Result<()> {
    let source: PathBuf = source.to_path_buf();
    let archive: PathBuf = archive.to_path_buf();

    tokio::task::spawn_blocking(move || -> io::Result<()> {
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoder = GzEncoder::new(File::create(&archive)?, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &source)?;
        builder.into_inner()?.finish()?;
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

/// Deletes an unpacked bundle. A missing directory is not an error.
pub async fn remove_bundle(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
