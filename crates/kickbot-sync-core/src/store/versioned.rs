//! Transactional SQLite queue used by the background interception path

use super::QueueStore;
use crate::error::StoreError;
use crate::types::{QueuedMutation, SyncQueue};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;

/// Schema version recorded in `PRAGMA user_version`
pub const VERSIONED_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed [`QueueStore`]
#[derive(Debug, Clone)]
pub struct VersionedQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl VersionedQueueStore {
    /// Open or create the database file and migrate it
    ///
    /// # Errors
    /// `StoreError` when the file cannot be created or migrated
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::from_connection(conn)
    }

    /// Private in-memory database
    ///
    /// # Errors
    /// `StoreError::Sqlite` if SQLite cannot allocate the database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    record TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );",
            )?;
            conn.pragma_update(None, "user_version", 1_i64)?;
            tracing::debug!("versioned queue migrated to schema 1");
        }

        Ok(())
    }

    /// Schema version of the open database
    ///
    /// # Errors
    /// `StoreError::Sqlite` on query failure
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

#[async_trait]
impl QueueStore for VersionedQueueStore {
    fn name(&self) -> &'static str {
        "versioned"
    }

    async fn load(&self) -> SyncQueue {
        let result = self
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                let rows = {
                    let mut stmt = tx.prepare("SELECT id, record FROM queue ORDER BY id")?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };

                let mut queue = Vec::with_capacity(rows.len());
                for (id, record) in rows {
                    match serde_json::from_str::<QueuedMutation>(&record) {
                        Ok(mutation) => queue.push(mutation),
                        Err(err) => {
                            tracing::warn!(id, "dropping corrupt versioned queue row: {err}");
                            tx.execute("DELETE FROM queue WHERE id = ?1", params![id])?;
                        }
                    }
                }
                tx.commit()?;
                Ok(queue)
            })
            .await;

        result.unwrap_or_else(|err| {
            tracing::warn!("versioned queue unreadable, treating as empty: {err}");
            SyncQueue::new()
        })
    }

    async fn save(&self, queue: &[QueuedMutation]) -> Result<(), StoreError> {
        let records = queue
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM queue", [])?;
            let now = Utc::now().to_rfc3339();
            for record in &records {
                tx.execute(
                    "INSERT INTO queue (record, created_at) VALUES (?1, ?2)",
                    params![record, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn append(&self, mutation: QueuedMutation) -> Result<(), StoreError> {
        let record = serde_json::to_string(&mutation)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queue (record, created_at) VALUES (?1, ?2)",
                params![record, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_front(&self, count: usize) -> Result<(), StoreError> {
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM queue WHERE id IN (SELECT id FROM queue ORDER BY id LIMIT ?1)",
                params![limit],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM queue", [])?;
            Ok(())
        })
        .await
    }

    async fn len(&self) -> usize {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
        .unwrap_or(0)
    }
}
