//! Pull reconciler
//!
//! Treats every delta from `/sync/pull` as a signal to refetch the owning
//! collection; nothing is merged field by field.

use crate::auth::AuthGate;
use crate::dashboard::Dashboard;
use crate::error::SyncError;
use crate::transport::{ApiRequest, ApiResponse};
use crate::types::{Entity, EntityDelta, Stats};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Change feed endpoint
pub const SYNC_PULL_PATH: &str = "/sync/pull";

/// Run counters endpoint
pub const STATS_PATH: &str = "/dashboard/api/stats";

/// Search terms shorter than this are ignored
const MIN_SEARCH_CHARS: usize = 2;

/// Refetches collections when the server reports changes
pub struct PullReconciler {
    gate: Arc<AuthGate>,
    dashboard: Arc<dyn Dashboard>,
    filters: DashMap<Entity, String>,
    snapshots: DashMap<Entity, Vec<Value>>,
}

impl std::fmt::Debug for PullReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullReconciler")
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

impl PullReconciler {
    /// Create reconciler
    #[must_use]
    pub fn new(gate: Arc<AuthGate>, dashboard: Arc<dyn Dashboard>) -> Self {
        Self {
            gate,
            dashboard,
            filters: DashMap::new(),
            snapshots: DashMap::new(),
        }
    }

    /// Fetch pending deltas and refetch each affected collection once.
    ///
    /// A failed refetch is logged and does not fail the pull.
    ///
    /// # Errors
    /// `SyncError` when the change feed itself could not be read
    pub async fn pull(&self) -> Result<Vec<EntityDelta>, SyncError> {
        let response = checked(self.gate.send(ApiRequest::get(SYNC_PULL_PATH)).await?)?;
        let events = response
            .body
            .get("events")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::MalformedResponse("pull body has no events array".into()))?;

        let deltas: Vec<EntityDelta> = events.iter().filter_map(EntityDelta::from_event).collect();
        if deltas.len() < events.len() {
            tracing::debug!(
                skipped = events.len() - deltas.len(),
                "ignoring events for unknown entities"
            );
        }

        let affected: BTreeSet<Entity> = deltas.iter().map(|d| d.entity).collect();
        for entity in affected {
            if let Err(err) = self.refresh(entity).await {
                tracing::warn!(%entity, "refetch after delta failed: {err}");
            }
        }

        tracing::debug!(deltas = deltas.len(), "pull complete");
        Ok(deltas)
    }

    /// Refetch one collection; returns whether the projection changed
    ///
    /// # Errors
    /// `SyncError` when the collection could not be fetched or parsed
    pub async fn refresh(&self, entity: Entity) -> Result<bool, SyncError> {
        let mut request = ApiRequest::get(entity.collection_path());
        if let Some(term) = self.filters.get(&entity) {
            request = request.with_query("search", term.value().clone());
        }

        let response = checked(self.gate.send(request).await?)?;
        let items = collection_items(response.body)?;

        if self
            .snapshots
            .get(&entity)
            .is_some_and(|previous| *previous == items)
        {
            tracing::trace!(%entity, "collection unchanged");
            return Ok(false);
        }

        self.dashboard.render_collection(entity, &items);
        self.snapshots.insert(entity, items);
        Ok(true)
    }

    /// Refetch every collection
    pub async fn refresh_all(&self) {
        let results =
            futures::future::join_all(Entity::ALL.into_iter().map(|e| self.refresh(e))).await;
        for (entity, result) in Entity::ALL.into_iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(%entity, "initial load failed: {err}");
            }
        }
    }

    /// Refetch run counters
    ///
    /// # Errors
    /// `SyncError` when the counters could not be fetched or parsed
    pub async fn refresh_stats(&self) -> Result<Stats, SyncError> {
        let response = checked(self.gate.send(ApiRequest::get(STATS_PATH)).await?)?;
        let stats: Stats = serde_json::from_value(response.body)
            .map_err(|err| SyncError::MalformedResponse(format!("stats: {err}")))?;
        self.dashboard.render_stats(&stats);
        Ok(stats)
    }

    /// Set the search term for a collection; terms under two characters clear it.
    ///
    /// The cached snapshot is dropped so the next refresh always re-renders.
    pub fn set_filter(&self, entity: Entity, term: &str) {
        let term = term.trim();
        if term.chars().count() >= MIN_SEARCH_CHARS {
            self.filters.insert(entity, term.to_string());
        } else {
            self.filters.remove(&entity);
        }
        self.snapshots.remove(&entity);
    }

    /// Last projected snapshot of a collection
    #[must_use]
    pub fn snapshot(&self, entity: Entity) -> Option<Vec<Value>> {
        self.snapshots.get(&entity).map(|s| s.value().clone())
    }
}

fn checked(response: ApiResponse) -> Result<ApiResponse, SyncError> {
    if response.is_unauthorized() {
        Err(SyncError::Unauthenticated)
    } else if let Some(message) = response.domain_error() {
        Err(SyncError::Domain(message))
    } else if !response.is_success() {
        Err(SyncError::Http {
            status: response.status,
        })
    } else {
        Ok(response)
    }
}

/// Collections come back either as `{items: [...], total}` or a bare array
fn collection_items(body: Value) -> Result<Vec<Value>, SyncError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(SyncError::MalformedResponse(
                "collection object without items array".into(),
            )),
        },
        other => Err(SyncError::MalformedResponse(format!(
            "unexpected collection body: {other}"
        ))),
    }
}
