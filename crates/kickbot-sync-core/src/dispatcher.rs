//! Mutation dispatcher
//!
//! Provides the write path of the client:
//! - One delivery attempt per mutation, queueing on transport failure
//! - Domain errors surfaced, never queued
//! - Single-flight drain of every queue store against `/sync/push`

use crate::auth::AuthGate;
use crate::error::{SyncError, TransportError};
use crate::store::QueueStore;
use crate::transport::{ApiRequest, ApiResponse};
use crate::types::{MutationRequest, QueuedMutation, SyncQueue};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bulk ingestion endpoint
pub const SYNC_PUSH_PATH: &str = "/sync/push";

/// Whether the client believes it can reach the server
#[derive(Debug, Clone)]
pub struct NetworkState {
    online: Arc<AtomicBool>,
}

impl NetworkState {
    /// Create with an initial value
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    /// Current belief
    #[inline]
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Update the belief, returning the previous value
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::AcqRel);
        if previous != online {
            tracing::info!(online, "network state changed");
        }
        previous
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Outcome of a dispatch that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Server accepted the mutation; parsed response body
    Delivered(Value),
    /// Stored in the session queue for a later drain
    Queued(QueuedMutation),
    /// Stored by the background interceptor
    Deferred,
}

/// Outcome of one drain trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReport {
    /// Another drain is in flight
    AlreadyRunning,
    /// Client believes it is offline
    Offline,
    /// Nothing pending
    Empty,
    /// Every pending mutation was accepted
    Pushed { count: usize },
    /// A batch was rejected or could not be sent; `pending` entries remain
    Failed { pushed: usize, pending: usize },
}

/// Resets the in-progress flag when the drain ends
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sends mutations and replays the queues
pub struct MutationDispatcher {
    gate: Arc<AuthGate>,
    primary: Arc<dyn QueueStore>,
    drain_sources: Vec<Arc<dyn QueueStore>>,
    network: NetworkState,
    draining: AtomicBool,
}

impl std::fmt::Debug for MutationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationDispatcher")
            .field("primary", &self.primary.name())
            .field(
                "drain_sources",
                &self.drain_sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("online", &self.network.is_online())
            .finish_non_exhaustive()
    }
}

impl MutationDispatcher {
    /// Create a dispatcher that queues into and drains `primary`
    #[must_use]
    pub fn new(gate: Arc<AuthGate>, primary: Arc<dyn QueueStore>, network: NetworkState) -> Self {
        Self {
            gate,
            drain_sources: vec![Arc::clone(&primary)],
            primary,
            network,
            draining: AtomicBool::new(false),
        }
    }

    /// Also drain `store`, after every source added before it
    #[must_use]
    pub fn with_drain_source(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.drain_sources.push(store);
        self
    }

    /// Network belief shared with the rest of the client
    #[inline]
    #[must_use]
    pub fn network(&self) -> &NetworkState {
        &self.network
    }

    /// Attempt delivery once; queue on transport failure.
    ///
    /// # Errors
    /// - `SyncError::Domain` when the body carries an `error` field
    /// - `SyncError::Unauthenticated` on 401 after the gate's retry
    /// - `SyncError::Http` for other non-2xx statuses
    /// - `SyncError::Transport` for non-queueable requests that got no response
    /// - `SyncError::Store` if queueing itself failed
    pub async fn dispatch(&self, request: &MutationRequest) -> Result<Dispatched, SyncError> {
        if !self.network.is_online() {
            if request.queueable {
                tracing::info!(path = %request.path, "offline, queueing without attempt");
                return self.enqueue(request).await;
            }
            return Err(TransportError::Offline.into());
        }

        match self.gate.send(request.to_api_request()).await {
            Ok(response) if response.is_deferred() => {
                tracing::info!(path = %request.path, "mutation stored by background interceptor");
                Ok(Dispatched::Deferred)
            }
            Ok(response) => interpret(response).map(Dispatched::Delivered),
            Err(err) if request.queueable => {
                tracing::warn!(path = %request.path, "delivery failed, queueing: {err}");
                self.enqueue(request).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn enqueue(&self, request: &MutationRequest) -> Result<Dispatched, SyncError> {
        let mutation = request.to_queued();
        self.primary.append(mutation.clone()).await?;
        tracing::info!(
            entity = %mutation.entity,
            action = %mutation.action,
            store = self.primary.name(),
            "mutation queued"
        );
        Ok(Dispatched::Queued(mutation))
    }

    /// Replay every queue store in order.
    ///
    /// Each store is sent as one batch and trimmed only if the batch was
    /// accepted. The first failure stops the cycle so later stores never
    /// overtake earlier ones. Concurrent triggers return `AlreadyRunning`.
    pub async fn drain(&self) -> DrainReport {
        let Some(_flight) = DrainGuard::acquire(&self.draining) else {
            tracing::debug!("drain already in flight");
            return DrainReport::AlreadyRunning;
        };
        if !self.network.is_online() {
            return DrainReport::Offline;
        }

        let mut pushed = 0;
        for (index, store) in self.drain_sources.iter().enumerate() {
            let queue = store.load().await;
            if queue.is_empty() {
                continue;
            }

            if let Err(err) = self.push(&queue).await {
                let mut pending = queue.len();
                for later in &self.drain_sources[index + 1..] {
                    pending += later.len().await;
                }
                tracing::warn!(store = store.name(), pending, "drain failed: {err}");
                return DrainReport::Failed { pushed, pending };
            }

            if let Err(err) = store.remove_front(queue.len()).await {
                tracing::error!(
                    store = store.name(),
                    "pushed batch not removed, it will be replayed: {err}"
                );
                return DrainReport::Failed {
                    pushed,
                    pending: queue.len(),
                };
            }

            tracing::info!(store = store.name(), count = queue.len(), "queue drained");
            pushed += queue.len();
        }

        if pushed == 0 {
            DrainReport::Empty
        } else {
            DrainReport::Pushed { count: pushed }
        }
    }

    async fn push(&self, queue: &SyncQueue) -> Result<(), SyncError> {
        let body = serde_json::to_value(queue).map_err(crate::error::StoreError::from)?;
        let response = self.gate.send(ApiRequest::post(SYNC_PUSH_PATH, body)).await?;
        if response.is_success() {
            Ok(())
        } else if response.is_unauthorized() {
            Err(SyncError::Unauthenticated)
        } else {
            Err(SyncError::Http {
                status: response.status,
            })
        }
    }

    /// Everything pending, in drain order
    pub async fn pending(&self) -> SyncQueue {
        let mut all = SyncQueue::new();
        for store in &self.drain_sources {
            all.extend(store.load().await);
        }
        all
    }

    /// Drop everything pending without sending it
    ///
    /// # Errors
    /// `SyncError::Store` from the first store that failed to clear
    pub async fn discard_pending(&self) -> Result<usize, SyncError> {
        let mut discarded = 0;
        for store in &self.drain_sources {
            discarded += store.len().await;
            store.clear_all().await?;
        }
        tracing::warn!(discarded, "pending mutations discarded");
        Ok(discarded)
    }
}

fn interpret(response: ApiResponse) -> Result<Value, SyncError> {
    if response.is_unauthorized() {
        return Err(SyncError::Unauthenticated);
    }
    if let Some(message) = response.domain_error() {
        return Err(SyncError::Domain(message));
    }
    if !response.is_success() {
        return Err(SyncError::Http {
            status: response.status,
        });
    }
    Ok(response.body)
}
