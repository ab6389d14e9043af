//! Persistent store of service records and user bindings.
//!
//! The launcher treats the registry as the single source of truth. Two
//! implementations are provided:
//!
//! - [`SqliteRegistry`] - the on-device store, one SQLite file.
//! - [`MemoryRegistry`] - same semantics, kept in memory (tests, ephemeral runs).
//!
//! Every id-keyed mutator fails with [`RegistryError::NotFound`] when no record
//! matches. The launcher decides which of those conditions are benign.

mod memory;
mod sqlite;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

use crate::error::RegistryError;
use crate::model::{ServiceRecord, ServiceState, ServiceStatus, UserSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type RegistryResult<T> = Result<T, RegistryError>;

#[async_trait]
pub trait Registry: Send + Sync + 'static {
    async fn add_service(&self, record: ServiceRecord) -> RegistryResult<()>;

    /// Replaces every field of the record with the same id.
    async fn update_service(&self, record: ServiceRecord) -> RegistryResult<()>;

    async fn remove_service(&self, id: &str) -> RegistryResult<()>;

    async fn service(&self, id: &str) -> RegistryResult<ServiceRecord>;

    async fn services(&self) -> RegistryResult<Vec<ServiceRecord>>;

    async fn set_service_state(&self, id: &str, state: ServiceState) -> RegistryResult<()>;

    async fn set_service_status(&self, id: &str, status: ServiceStatus) -> RegistryResult<()>;

    async fn set_service_start_time(&self, id: &str, time: DateTime<Utc>) -> RegistryResult<()>;

    async fn add_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<()>;

    async fn remove_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<()>;

    /// Records of every service bound to `users`.
    async fn users_services(&self, users: &UserSet) -> RegistryResult<Vec<ServiceRecord>>;

    async fn is_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<bool>;

    /// Every distinct user set that has at least one binding row.
    async fn users_list(&self) -> RegistryResult<Vec<UserSet>>;

    /// Deletes every binding row of `users`.
    async fn delete_users(&self, users: &UserSet) -> RegistryResult<()>;

    // --- Provided helpers ---

    /// Like [`Registry::service`], with a missing record mapped to `None`.
    async fn find_service(&self, id: &str) -> RegistryResult<Option<ServiceRecord>> {
        match self.service(id).await {
            Ok(record) => Ok(Some(record)),
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The user set owning `id`, if any.
    async fn service_users(&self, id: &str) -> RegistryResult<Option<UserSet>> {
        for users in self.users_list().await? {
            if self.is_users_service(&users, id).await? {
                return Ok(Some(users));
            }
        }
        Ok(None)
    }
}

/// Shared contract checks run against every registry implementation.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use std::path::PathBuf;

    pub fn record(id: &str, version: u64) -> ServiceRecord {
        ServiceRecord {
            id: id.to_string(),
            version,
            bundle_path: PathBuf::from(format!("/tmp/services/{id}_v{version}")),
            unit_name: format!("aos_{id}.service"),
            run_user: "root".to_string(),
            permissions: r#"{"*": "rw"}"#.to_string(),
            state: ServiceState::Running,
            status: ServiceStatus::Ok,
            started_at: Utc::now(),
            ttl_days: 30,
        }
    }

    pub async fn crud(registry: &dyn Registry) {
        registry.add_service(record("svc0", 1)).await.unwrap();
        assert_eq!(
            registry.add_service(record("svc0", 2)).await,
            Err(RegistryError::AlreadyExists("svc0".into()))
        );

        let stored = registry.service("svc0").await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.permissions, r#"{"*": "rw"}"#);

        registry.update_service(record("svc0", 3)).await.unwrap();
        assert_eq!(registry.service("svc0").await.unwrap().version, 3);
        assert_eq!(registry.services().await.unwrap().len(), 1);

        registry
            .set_service_state("svc0", ServiceState::Stopped)
            .await
            .unwrap();
        registry
            .set_service_status("svc0", ServiceStatus::Error)
            .await
            .unwrap();
        let stored = registry.service("svc0").await.unwrap();
        assert_eq!(stored.state, ServiceState::Stopped);
        assert_eq!(stored.status, ServiceStatus::Error);

        registry.remove_service("svc0").await.unwrap();
        assert!(registry.find_service("svc0").await.unwrap().is_none());
    }

    pub async fn missing_ids(registry: &dyn Registry) {
        let not_found = Err(RegistryError::NotFound("ghost".into()));
        assert_eq!(registry.update_service(record("ghost", 1)).await, not_found);
        assert_eq!(registry.remove_service("ghost").await, not_found);
        assert_eq!(
            registry.set_service_state("ghost", ServiceState::Running).await,
            not_found
        );
        assert_eq!(
            registry.set_service_status("ghost", ServiceStatus::Ok).await,
            not_found
        );
        assert_eq!(
            registry.set_service_start_time("ghost", Utc::now()).await,
            not_found
        );
        assert!(matches!(
            registry.service("ghost").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    pub async fn start_time(registry: &dyn Registry) {
        registry.add_service(record("svc0", 1)).await.unwrap();
        let past = Utc::now() - chrono::Duration::days(40);
        registry.set_service_start_time("svc0", past).await.unwrap();

        let stored = registry.service("svc0").await.unwrap();
        assert_eq!(stored.started_at.timestamp(), past.timestamp());
        assert!(stored.is_expired(Utc::now()));
    }

    pub async fn bindings(registry: &dyn Registry) {
        let alice = UserSet::new(["alice"]);
        let bob = UserSet::new(["bob"]);

        for id in ["a0", "a1", "b0"] {
            registry.add_service(record(id, 0)).await.unwrap();
        }
        registry.add_users_service(&alice, "a0").await.unwrap();
        registry.add_users_service(&alice, "a1").await.unwrap();
        registry.add_users_service(&bob, "b0").await.unwrap();

        let mut ids: Vec<String> = registry
            .users_services(&alice)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a0", "a1"]);

        assert!(registry.is_users_service(&bob, "b0").await.unwrap());
        assert!(!registry.is_users_service(&bob, "a0").await.unwrap());
        assert_eq!(
            registry.service_users("b0").await.unwrap(),
            Some(bob.clone())
        );
        assert_eq!(registry.service_users("nobody").await.unwrap(), None);

        let mut list = registry.users_list().await.unwrap();
        list.sort_by_key(|u| u.to_string());
        assert_eq!(list, vec![alice.clone(), bob.clone()]);

        registry.remove_users_service(&alice, "a0").await.unwrap();
        assert_eq!(registry.users_services(&alice).await.unwrap().len(), 1);

        registry.delete_users(&alice).await.unwrap();
        assert_eq!(registry.users_list().await.unwrap(), vec![bob]);
    }
}
