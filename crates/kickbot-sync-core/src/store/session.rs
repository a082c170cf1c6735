//! Session document: a string key-value map persisted as one JSON file.
//!
//! Holds the manual sync queue and the bearer credentials. Every write
//! replaces the file through a rename, so readers in another context see
//! either the old or the new document. Writers on any handle, in any
//! process, take an immediate transaction on a sibling SQLite file
//! (`<name>.lock`) for the whole read-modify-write.

use super::QueueStore;
use crate::error::StoreError;
use crate::types::{Credential, QueuedMutation, SyncQueue};
use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Key of the queued mutation array
pub const SYNC_QUEUE_KEY: &str = "syncQueue";
/// Key of the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";
/// Key of the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// How long a writer waits for another handle to finish its update
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

type Document = BTreeMap<String, String>;

/// Shared key-value session document
#[derive(Debug)]
pub struct SessionStorage {
    path: PathBuf,
    lock_path: PathBuf,
    write_lock: Mutex<()>,
}

/// Writer lock held across handles and processes. Dropping it without
/// `release` rolls back, which frees the lock as well.
struct DocumentLock {
    conn: Connection,
}

impl DocumentLock {
    async fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || -> Result<Self, StoreError> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.busy_timeout(LOCK_TIMEOUT)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(Self { conn })
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn release(self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }
}

impl SessionStorage {
    /// Open the document at `path`; the file is created on first write
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value stored under `key`
    pub async fn get_item(&self, key: &str) -> Option<String> {
        self.read_document().await.remove(key)
    }

    /// Store `value` under `key`
    pub async fn set_item(&self, key: &str, value: impl Into<String>) -> Result<(), StoreError> {
        let value = value.into();
        self.update(|doc| {
            doc.insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    /// Read-modify-write under the writer lock shared by every handle on
    /// this file
    pub async fn update<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> Result<(), StoreError>,
    {
        let _local = self.write_lock.lock().await;
        let lock = DocumentLock::acquire(self.lock_path.clone()).await?;
        let mut doc = self.read_document().await;
        apply(&mut doc)?;
        self.write_document(&doc).await?;
        lock.release()
    }

    async fn read_document(&self) -> Document {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Document::new(),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "session document unreadable: {err}");
                return Document::new();
            }
        };
        if raw.trim().is_empty() {
            return Document::new();
        }
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!(path = %self.path.display(), "session document corrupt, starting empty: {err}");
            Document::new()
        })
    }

    async fn write_document(&self, doc: &Document) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_vec_pretty(doc)?;
        let tmp = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn parse_queue(raw: Option<&String>) -> SyncQueue {
    let Some(raw) = raw else {
        return SyncQueue::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::warn!("persisted sync queue corrupt, treating as empty: {err}");
        SyncQueue::new()
    })
}

/// Manual sync queue kept under [`SYNC_QUEUE_KEY`]
#[derive(Debug, Clone)]
pub struct SessionQueueStore {
    storage: Arc<SessionStorage>,
}

impl SessionQueueStore {
    /// Queue view over a session document
    #[must_use]
    pub fn new(storage: Arc<SessionStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl QueueStore for SessionQueueStore {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn load(&self) -> SyncQueue {
        parse_queue(self.storage.get_item(SYNC_QUEUE_KEY).await.as_ref())
    }

    async fn save(&self, queue: &[QueuedMutation]) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(queue)?;
        self.storage.set_item(SYNC_QUEUE_KEY, encoded).await
    }

    async fn append(&self, mutation: QueuedMutation) -> Result<(), StoreError> {
        self.storage
            .update(|doc| {
                let mut queue = parse_queue(doc.get(SYNC_QUEUE_KEY));
                queue.push(mutation);
                doc.insert(SYNC_QUEUE_KEY.to_string(), serde_json::to_string(&queue)?);
                Ok(())
            })
            .await
    }

    async fn remove_front(&self, count: usize) -> Result<(), StoreError> {
        self.storage
            .update(|doc| {
                let mut queue = parse_queue(doc.get(SYNC_QUEUE_KEY));
                queue.drain(..count.min(queue.len()));
                doc.insert(SYNC_QUEUE_KEY.to_string(), serde_json::to_string(&queue)?);
                Ok(())
            })
            .await
    }
}

/// Bearer credentials kept in the session document
#[derive(Debug, Clone)]
pub struct CredentialStore {
    storage: Arc<SessionStorage>,
}

impl CredentialStore {
    /// Credential view over a session document
    #[must_use]
    pub fn new(storage: Arc<SessionStorage>) -> Self {
        Self { storage }
    }

    /// Current credentials
    pub async fn load(&self) -> Credential {
        Credential {
            access_token: self.storage.get_item(ACCESS_TOKEN_KEY).await,
            refresh_token: self.storage.get_item(REFRESH_TOKEN_KEY).await,
        }
    }

    /// Replace the access token, leaving the refresh token untouched
    pub async fn set_access_token(&self, token: &str) -> Result<(), StoreError> {
        self.storage.set_item(ACCESS_TOKEN_KEY, token).await
    }

    /// Replace both tokens in one write
    pub async fn store(&self, credential: &Credential) -> Result<(), StoreError> {
        self.storage
            .update(|doc| {
                for (key, value) in [
                    (ACCESS_TOKEN_KEY, &credential.access_token),
                    (REFRESH_TOKEN_KEY, &credential.refresh_token),
                ] {
                    match value {
                        Some(v) => doc.insert(key.to_string(), v.clone()),
                        None => doc.remove(key),
                    };
                }
                Ok(())
            })
            .await
    }

    /// Forget both tokens
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store(&Credential::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Entity;
    use serde_json::json;

    fn storage(dir: &tempfile::TempDir) -> Arc<SessionStorage> {
        Arc::new(SessionStorage::open(dir.path().join("state/session.json")))
    }

    #[tokio::test]
    async fn missing_document_loads_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionQueueStore::new(storage(&dir));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn append_preserves_order_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let first = SessionQueueStore::new(storage(&dir));
        let second = SessionQueueStore::new(storage(&dir));

        first
            .append(QueuedMutation::new(Entity::Group, "create", json!({"name": "a"})))
            .await
            .unwrap();
        second
            .append(QueuedMutation::new(Entity::Account, "create", json!({"username": "b"})))
            .await
            .unwrap();

        let queue = first.load().await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].entity, Entity::Group);
        assert_eq!(queue[1].entity, Entity::Account);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_through_separate_handles_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let writers: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|handle| {
                let store = SessionQueueStore::new(storage(&dir));
                tokio::spawn(async move {
                    for n in 0..50 {
                        store
                            .append(QueuedMutation::new(
                                Entity::Group,
                                "create",
                                json!({ "name": format!("{handle}-{n}") }),
                            ))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in futures::future::join_all(writers).await {
            writer.unwrap();
        }

        let queue = SessionQueueStore::new(storage(&dir)).load().await;
        assert_eq!(queue.len(), 100);
        for handle in ["first", "second"] {
            let names: Vec<String> = queue
                .iter()
                .filter_map(|m| m.payload["name"].as_str())
                .filter(|name| name.starts_with(handle))
                .map(str::to_string)
                .collect();
            let expected: Vec<String> = (0..50).map(|n| format!("{handle}-{n}")).collect();
            assert_eq!(names, expected);
        }
    }

    #[tokio::test]
    async fn corrupt_queue_value_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.set_item(SYNC_QUEUE_KEY, "{not json").await.unwrap();

        let store = SessionQueueStore::new(storage.clone());
        assert!(store.load().await.is_empty());

        store
            .append(QueuedMutation::new(Entity::Bot, "say", json!({"id": 1})))
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn corrupt_document_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"\x00garbage").unwrap();

        let storage = Arc::new(SessionStorage::open(&path));
        assert_eq!(storage.get_item(ACCESS_TOKEN_KEY).await, None);
        assert!(SessionQueueStore::new(storage).load().await.is_empty());
    }

    #[tokio::test]
    async fn remove_front_keeps_newer_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionQueueStore::new(storage(&dir));
        for name in ["a", "b", "c"] {
            store
                .append(QueuedMutation::new(Entity::Group, "create", json!({ "name": name })))
                .await
                .unwrap();
        }

        store.remove_front(2).await.unwrap();
        let queue = store.load().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].payload, json!({"name": "c"}));

        store.remove_front(10).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn credentials_round_trip_and_token_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = CredentialStore::new(storage(&dir));
        assert_eq!(credentials.load().await, Credential::default());

        credentials.store(&Credential::new("a1", "r1")).await.unwrap();
        credentials.set_access_token("a2").await.unwrap();
        assert_eq!(credentials.load().await, Credential::new("a2", "r1"));

        credentials.clear().await.unwrap();
        assert_eq!(credentials.load().await, Credential::default());
    }

    #[tokio::test]
    async fn queue_and_credentials_share_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let credentials = CredentialStore::new(storage.clone());
        let queue = SessionQueueStore::new(storage.clone());

        credentials.store(&Credential::new("a", "r")).await.unwrap();
        queue
            .append(QueuedMutation::new(Entity::Group, "create", json!({})))
            .await
            .unwrap();
        queue.clear_all().await.unwrap();

        assert_eq!(credentials.load().await.access_token.as_deref(), Some("a"));
        assert_eq!(storage.get_item(SYNC_QUEUE_KEY).await.as_deref(), Some("[]"));
    }
}
