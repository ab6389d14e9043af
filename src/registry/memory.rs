use super::{Registry, RegistryResult};
use crate::error::RegistryError;
use crate::model::{ServiceRecord, ServiceState, ServiceStatus, UserSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
struct Tables {
    services: BTreeMap<String, ServiceRecord>,
    /// `(users, service id)` rows, unique as a pair.
    users: Vec<(UserSet, String)>,
}

/// In-memory [`Registry`] with the same semantics as [`SqliteRegistry`](super::SqliteRegistry).
#[derive(Default)]
pub struct MemoryRegistry {
    tables: Mutex<Tables>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_service<F>(&self, id: &str, f: F) -> RegistryResult<()>
    where
        F: FnOnce(&mut ServiceRecord),
    {
        let mut tables = self.tables.lock();
        let record = tables
            .services
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn add_service(&self, record: ServiceRecord) -> RegistryResult<()> {
        let mut tables = self.tables.lock();
        if tables.services.contains_key(&record.id) {
            return Err(RegistryError::AlreadyExists(record.id));
        }
        tables.services.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_service(&self, record: ServiceRecord) -> RegistryResult<()> {
        let id = record.id.clone();
        self.with_service(&id, |stored| *stored = record)
    }

    async fn remove_service(&self, id: &str) -> RegistryResult<()> {
        self.tables
            .lock()
            .services
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn service(&self, id: &str) -> RegistryResult<ServiceRecord> {
        self.tables
            .lock()
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn services(&self) -> RegistryResult<Vec<ServiceRecord>> {
        Ok(self.tables.lock().services.values().cloned().collect())
    }

    async fn set_service_state(&self, id: &str, state: ServiceState) -> RegistryResult<()> {
        self.with_service(id, |record| record.state = state)
    }

    async fn set_service_status(&self, id: &str, status: ServiceStatus) -> RegistryResult<()> {
        self.with_service(id, |record| record.status = status)
    }

    async fn set_service_start_time(&self, id: &str, time: DateTime<Utc>) -> RegistryResult<()> {
        self.with_service(id, |record| record.started_at = time)
    }

    async fn add_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<()> {
        let mut tables = self.tables.lock();
        if tables.users.iter().any(|(u, s)| u == users && s == id) {
            return Err(RegistryError::AlreadyExists(format!("{users}/{id}")));
        }
        tables.users.push((users.clone(), id.to_string()));
        Ok(())
    }

    async fn remove_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<()> {
        self.tables
            .lock()
            .users
            .retain(|(u, s)| !(u == users && s == id));
        Ok(())
    }

    async fn users_services(&self, users: &UserSet) -> RegistryResult<Vec<ServiceRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .users
            .iter()
            .filter(|(u, _)| u == users)
            .filter_map(|(_, id)| tables.services.get(id).cloned())
            .collect())
    }

    async fn is_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<bool> {
        Ok(self
            .tables
            .lock()
            .users
            .iter()
            .any(|(u, s)| u == users && s == id))
    }

    async fn users_list(&self) -> RegistryResult<Vec<UserSet>> {
        let tables = self.tables.lock();
        let mut list: Vec<UserSet> = Vec::new();
        for (users, _) in &tables.users {
            if !list.contains(users) {
                list.push(users.clone());
            }
        }
        Ok(list)
    }

    async fn delete_users(&self, users: &UserSet) -> RegistryResult<()> {
        self.tables.lock().users.retain(|(u, _)| u != users);
        Ok(())
    }
}
