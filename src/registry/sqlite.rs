use super::{Registry, RegistryResult};
use crate::error::RegistryError;
use crate::model::{ServiceRecord, ServiceState, ServiceStatus, UserSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const SERVICE_COLUMNS: &str =
    "id, version, path, service, user, permissions, state, status, startat, ttl";

/// SQLite-backed [`Registry`].
///
/// Queries run on the blocking thread pool; the connection itself is guarded by
/// a mutex so concurrent lifecycle operations never share a statement.
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteRegistry {
    /// Opens (or creates) the registry file, creating missing tables.
    pub async fn open(path: impl Into<PathBuf>) -> RegistryResult<Self> {
        let path = path.into();
        debug!(path = %path.display(), "Open registry");

        let db_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> RegistryResult<Connection> {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RegistryError::Database(e.to_string()))?;
            }
            let conn = Connection::open(&db_path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            create_tables(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| RegistryError::Database(format!("registry task failed: {e}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn call<T, F>(&self, f: F) -> RegistryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> RegistryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| RegistryError::Database(format!("registry task failed: {e}")))?
    }

    /// Runs an UPDATE/DELETE keyed by `id`, mapping "no row touched" to NotFound.
    async fn execute_for<P>(&self, id: &str, sql: &'static str, params: P) -> RegistryResult<()>
    where
        P: rusqlite::Params + Send + 'static,
    {
        let id = id.to_string();
        self.call(move |conn| {
            if conn.execute(sql, params)? == 0 {
                return Err(RegistryError::NotFound(id));
            }
            Ok(())
        })
        .await
    }
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'services'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    if exists.is_none() {
        info!("Service table doesn't exist, creating tables");
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS services (id TEXT NOT NULL PRIMARY KEY,
                                              version INTEGER,
                                              path TEXT,
                                              service TEXT,
                                              user TEXT,
                                              permissions TEXT,
                                              state TEXT,
                                              status TEXT,
                                              startat TEXT,
                                              ttl INTEGER);
         CREATE TABLE IF NOT EXISTS users (users TEXT NOT NULL,
                                           serviceid TEXT NOT NULL,
                                           PRIMARY KEY(users, serviceid));",
    )
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ServiceRecord> {
    let path: String = row.get(2)?;
    let state: String = row.get(6)?;
    let status: String = row.get(7)?;
    let started_at: String = row.get(8)?;

    Ok(ServiceRecord {
        id: row.get(0)?,
        version: row.get(1)?,
        bundle_path: PathBuf::from(path),
        unit_name: row.get(3)?,
        run_user: row.get(4)?,
        permissions: row.get(5)?,
        state: state.parse().map_err(|e| conversion_error(6, e))?,
        status: status.parse().map_err(|e| conversion_error(7, e))?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map_err(|e| conversion_error(8, e.to_string()))?
            .with_timezone(&Utc),
        ttl_days: row.get(9)?,
    })
}

fn users_key(users: &UserSet) -> RegistryResult<String> {
    Ok(serde_json::to_string(users)?)
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn add_service(&self, record: ServiceRecord) -> RegistryResult<()> {
        self.call(move |conn| {
            let result = conn.execute(
                "INSERT INTO services VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.version,
                    record.bundle_path.to_string_lossy().into_owned(),
                    record.unit_name,
                    record.run_user,
                    record.permissions,
                    record.state.as_str(),
                    record.status.as_str(),
                    record.started_at.to_rfc3339(),
                    record.ttl_days,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(RegistryError::AlreadyExists(record.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update_service(&self, record: ServiceRecord) -> RegistryResult<()> {
        let id = record.id.clone();
        self.execute_for(
            &id,
            "UPDATE services SET version = ?1, path = ?2, service = ?3, user = ?4,
                                 permissions = ?5, state = ?6, status = ?7, startat = ?8,
                                 ttl = ?9
             WHERE id = ?10",
            (
                record.version,
                record.bundle_path.to_string_lossy().into_owned(),
                record.unit_name,
                record.run_user,
                record.permissions,
                record.state.as_str(),
                record.status.as_str(),
                record.started_at.to_rfc3339(),
                record.ttl_days,
                record.id,
            ),
        )
        .await
    }

    async fn remove_service(&self, id: &str) -> RegistryResult<()> {
        self.execute_for(id, "DELETE FROM services WHERE id = ?1", (id.to_string(),))
            .await
    }

    async fn service(&self, id: &str) -> RegistryResult<ServiceRecord> {
        let id = id.to_string();
        self.call(move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?1"),
                    [&id],
                    row_to_record,
                )
                .optional()?;
            record.ok_or(RegistryError::NotFound(id))
        })
        .await
    }

    async fn services(&self) -> RegistryResult<Vec<ServiceRecord>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SERVICE_COLUMNS} FROM services"))?;
            let records = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn set_service_state(&self, id: &str, state: ServiceState) -> RegistryResult<()> {
        self.execute_for(
            id,
            "UPDATE services SET state = ?1 WHERE id = ?2",
            (state.as_str(), id.to_string()),
        )
        .await
    }

    async fn set_service_status(&self, id: &str, status: ServiceStatus) -> RegistryResult<()> {
        self.execute_for(
            id,
            "UPDATE services SET status = ?1 WHERE id = ?2",
            (status.as_str(), id.to_string()),
        )
        .await
    }

    async fn set_service_start_time(&self, id: &str, time: DateTime<Utc>) -> RegistryResult<()> {
        self.execute_for(
            id,
            "UPDATE services SET startat = ?1 WHERE id = ?2",
            (time.to_rfc3339(), id.to_string()),
        )
        .await
    }

    async fn add_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<()> {
        let key = users_key(users)?;
        let id = id.to_string();
        self.call(move |conn| {
            match conn.execute("INSERT INTO users VALUES (?1, ?2)", params![key, id]) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(RegistryError::AlreadyExists(format!("{key}/{id}")))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn remove_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<()> {
        let key = users_key(users)?;
        let id = id.to_string();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM users WHERE users = ?1 AND serviceid = ?2",
                params![key, id],
            )?;
            Ok(())
        })
        .await
    }

    async fn users_services(&self, users: &UserSet) -> RegistryResult<Vec<ServiceRecord>> {
        let key = users_key(users)?;
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVICE_COLUMNS} FROM services
                 WHERE id IN (SELECT serviceid FROM users WHERE users = ?1)"
            ))?;
            let records = stmt
                .query_map([&key], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn is_users_service(&self, users: &UserSet, id: &str) -> RegistryResult<bool> {
        let key = users_key(users)?;
        let id = id.to_string();
        self.call(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM users WHERE users = ?1 AND serviceid = ?2",
                    params![key, id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn users_list(&self) -> RegistryResult<Vec<UserSet>> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT users FROM users")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            keys.iter()
                .map(|key| serde_json::from_str::<UserSet>(key).map_err(RegistryError::from))
                .collect()
        })
        .await
    }

    async fn delete_users(&self, users: &UserSet) -> RegistryResult<()> {
        let key = users_key(users)?;
        self.call(move |conn| {
            conn.execute("DELETE FROM users WHERE users = ?1", [&key])?;
            Ok(())
        })
        .await
    }
}
