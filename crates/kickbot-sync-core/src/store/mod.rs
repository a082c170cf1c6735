//! Durable queue stores
//!
//! Two implementations of the same capability:
//! - [`SessionQueueStore`]: the `syncQueue` key of the shared session document
//! - [`VersionedQueueStore`]: SQLite store written by the background interceptor
//!
//! Both are drained by [`crate::MutationDispatcher::drain`] in one cycle.

use crate::error::StoreError;
use crate::types::{QueuedMutation, SyncQueue};
use async_trait::async_trait;

mod session;
mod versioned;

pub use session::{
    CredentialStore, SessionQueueStore, SessionStorage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
    SYNC_QUEUE_KEY,
};
pub use versioned::{VersionedQueueStore, VERSIONED_SCHEMA_VERSION};

/// Persistent FIFO of queued mutations
///
/// Implementations share their state through durable storage so that any
/// context holding a handle to the same location observes the same queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Current contents in insertion order.
    ///
    /// Missing or corrupt data yields an empty queue.
    async fn load(&self) -> SyncQueue;

    /// Replace the contents
    async fn save(&self, queue: &[QueuedMutation]) -> Result<(), StoreError>;

    /// Append at the tail
    async fn append(&self, mutation: QueuedMutation) -> Result<(), StoreError>;

    /// Remove the `count` oldest entries
    async fn remove_front(&self, count: usize) -> Result<(), StoreError>;

    /// Remove everything
    async fn clear_all(&self) -> Result<(), StoreError> {
        self.save(&[]).await
    }

    /// Number of pending entries
    async fn len(&self) -> usize {
        self.load().await.len()
    }

    /// Nothing pending
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
