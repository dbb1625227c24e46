//! libSQL-backed [`Storer`], for sessions that outlive the process.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use super::storage::{KeyType, Storer};
use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "key_value",
    sql: r#"
        CREATE TABLE IF NOT EXISTS kv (
            key_type TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (key_type, key)
        );
    "#,
}];

/// Key-value store in a local libSQL database.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    closed: AtomicBool,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::with_database(db)?;
        store.init().await?;
        info!(path = %path.display(), "Session database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;
        let store = Self::with_database(db)?;
        store.init().await?;
        Ok(store)
    }

    fn with_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            closed: AtomicBool::new(false),
        })
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(&self.conn)
    }
}

impl std::fmt::Debug for LibSqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibSqlStore")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

// ── Migrations ──────────────────────────────────────────────────────

async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = current_version(conn).await?;
    for migration in MIGRATIONS {
        if migration.version > current_version {
            info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            conn.execute(
                "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
                params![migration.version, migration.name],
            )
            .await
            .map_err(|e| StoreError::Migration(format!("Failed to record migration: {e}")))?;
        }
    }
    Ok(())
}

/// Highest applied migration version, or 0 if none.
async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?
    {
        Some(row) => row.get(0).map_err(|e| {
            StoreError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

#[async_trait]
impl Storer for LibSqlStore {
    async fn init(&self) -> Result<(), StoreError> {
        run_migrations(self.conn()?).await
    }

    async fn put(&self, key_type: KeyType, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO kv (key_type, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key_type, key) DO UPDATE SET value = excluded.value,
                     updated_at = datetime('now')",
                params![key_type.as_str(), key, value],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put: {e}")))?;
        debug!(key_type = %key_type, key, "Stored value");
        Ok(())
    }

    async fn get(&self, key_type: KeyType, key: &str) -> Result<String, StoreError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT value FROM kv WHERE key_type = ?1 AND key = ?2",
                params![key_type.as_str(), key],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map_err(|e| StoreError::Query(format!("get row parse: {e}"))),
            Ok(None) => Err(StoreError::NotFound {
                key_type: key_type.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(StoreError::Query(format!("get: {e}"))),
        }
    }

    async fn list(&self, key_type: KeyType) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT key FROM kv WHERE key_type = ?1 ORDER BY key ASC",
                params![key_type.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list: {e}")))?;

        let mut keys = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list: {e}")))?
        {
            keys.push(
                row.get::<String>(0)
                    .map_err(|e| StoreError::Query(format!("list row parse: {e}")))?,
            );
        }
        Ok(keys)
    }

    async fn exists(&self, key_type: KeyType, key: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT COUNT(*) FROM kv WHERE key_type = ?1 AND key = ?2",
                params![key_type.as_str(), key],
            )
            .await
            .map_err(|e| StoreError::Query(format!("exists: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(StoreError::Query(format!("exists: {e}"))),
        }
    }

    async fn delete(&self, key_type: KeyType, key: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "DELETE FROM kv WHERE key_type = ?1 AND key = ?2",
                params![key_type.as_str(), key],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete: {e}")))?;
        Ok(())
    }

    async fn exit(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("Session database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.put(KeyType::JobSession, "wfl", "{}").await.unwrap();
        store.put(KeyType::JobSession, "alpha", "1").await.unwrap();
        store
            .put(KeyType::ReservationSession, "res", "2")
            .await
            .unwrap();

        assert_eq!(store.get(KeyType::JobSession, "wfl").await.unwrap(), "{}");
        assert_eq!(
            store.list(KeyType::JobSession).await.unwrap(),
            vec!["alpha", "wfl"]
        );
        assert!(store.exists(KeyType::ReservationSession, "res").await.unwrap());
        assert!(!store.exists(KeyType::JobSession, "res").await.unwrap());

        // upsert
        store.put(KeyType::JobSession, "wfl", "{\"a\":1}").await.unwrap();
        assert_eq!(
            store.get(KeyType::JobSession, "wfl").await.unwrap(),
            "{\"a\":1}"
        );

        store.delete(KeyType::JobSession, "wfl").await.unwrap();
        assert!(matches!(
            store.get(KeyType::JobSession, "wfl").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store.init().await.unwrap();
        store.init().await.unwrap();
        assert_eq!(current_version(&store.conn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            store.put(KeyType::JobSession, "kept", "v").await.unwrap();
            store.exit().await.unwrap();
            assert_eq!(
                store.list(KeyType::JobSession).await.unwrap_err(),
                StoreError::Closed
            );
        }
        let store = LibSqlStore::new_local(&path).await.unwrap();
        assert_eq!(store.get(KeyType::JobSession, "kept").await.unwrap(), "v");
    }
}
