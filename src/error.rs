//! Error types for the launcher.
//!
//! Every failure the launcher reports belongs to one of six buckets (see [`ErrorKind`]).
//! Each [`LauncherError`] variant carries enough text to be logged or shown to the cloud
//! as-is, and [`LauncherError::kind`] tells callers which bucket it falls in.

use thiserror::Error;

/// Classification of launcher failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stale or equal version install, or an ownership clash.
    Conflict,
    /// Operation on an unknown service id.
    NotFound,
    /// Bundle fetch failed.
    ProviderFailure,
    /// Configure, start or stop of the runtime unit failed.
    RuntimeFailure,
    /// Registry I/O failed.
    StorageFailure,
    /// A post-operation invariant check failed.
    ConsistencyFailure,
}

/// Errors that can occur during launcher operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LauncherError {
    /// The requested version is not newer than the installed one.
    #[error("Version conflict for service {id}: installed {installed}, requested {requested}")]
    VersionConflict {
        id: String,
        installed: u64,
        requested: u64,
    },

    /// The requested service is not installed.
    #[error("Service not found: {0}")]
    NotFound(String),

    /// The bundle provider could not deliver a bundle.
    #[error("Bundle provider error: {0}")]
    Provider(String),

    /// The runtime adapter failed.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The registry failed to read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A bulk operation left the system in an unexpected state.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// The launcher is shutting down and no longer accepts requests.
    #[error("Launcher closed")]
    Closed,

    /// A worker dropped the response channel before answering.
    #[error("Worker dropped response channel")]
    WorkerDropped,
}

impl LauncherError {
    /// Returns the taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LauncherError::VersionConflict { .. } => ErrorKind::Conflict,
            LauncherError::NotFound(_) => ErrorKind::NotFound,
            LauncherError::Provider(_) => ErrorKind::ProviderFailure,
            LauncherError::Runtime(_) | LauncherError::Closed | LauncherError::WorkerDropped => {
                ErrorKind::RuntimeFailure
            }
            LauncherError::Storage(_) => ErrorKind::StorageFailure,
            LauncherError::Consistency(_) => ErrorKind::ConsistencyFailure,
        }
    }
}

/// Errors raised by [`Registry`](crate::registry::Registry) implementations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    /// No record matched the given key.
    #[error("Service does not exist: {0}")]
    NotFound(String),

    /// A record with the same id is already stored.
    #[error("Service already exists: {0}")]
    AlreadyExists(String),

    /// An underlying database error occurred.
    #[error("Registry database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Database(e.to_string())
    }
}

impl From<RegistryError> for LauncherError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => LauncherError::NotFound(id),
            other => LauncherError::Storage(other.to_string()),
        }
    }
}

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Can't read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Can't parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_map_to_taxonomy() {
        let not_found: LauncherError = RegistryError::NotFound("svc".into()).into();
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let db: LauncherError = RegistryError::Database("disk full".into()).into();
        assert_eq!(db.kind(), ErrorKind::StorageFailure);
        assert!(db.to_string().contains("disk full"));
    }

    #[test]
    fn conflict_message_names_both_versions() {
        let err = LauncherError::VersionConflict {
            id: "svc-a".into(),
            installed: 5,
            requested: 4,
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            err.to_string(),
            "Version conflict for service svc-a: installed 5, requested 4"
        );
    }
}
