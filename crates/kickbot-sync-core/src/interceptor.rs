//! Background request interception
//!
//! Sits in front of a transport, outside the primary context. Dashboard POSTs
//! that get no response are converted into queued mutations, written to the
//! interceptor's own store and answered with a synthetic `202 {"queued": true}`.
//! The store is drained together with the session queue.

use crate::error::TransportError;
use crate::store::QueueStore;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Method};
use crate::types::{Entity, QueuedMutation, DASHBOARD_API};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Forwards requests, persisting dashboard POSTs that could not be delivered
pub struct Interceptor {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn QueueStore>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}

impl Interceptor {
    /// Create interceptor writing into `store`
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>, store: Arc<dyn QueueStore>) -> Self {
        Self { transport, store }
    }

    /// Requests this interceptor may persist
    #[must_use]
    pub fn intercepts(request: &ApiRequest) -> bool {
        request.method == Method::Post && request.path.starts_with(DASHBOARD_API)
    }

    /// Store backing the interception path
    #[must_use]
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }
}

#[async_trait]
impl HttpTransport for Interceptor {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let err = match self.transport.send(request).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        if !Self::intercepts(request) {
            return Err(err);
        }

        let Some(mutation) = mutation_from_request(request) else {
            tracing::debug!(path = %request.path, "no queued form for request, not intercepted");
            return Err(err);
        };

        if let Err(store_err) = self.store.append(mutation).await {
            tracing::error!(path = %request.path, "intercepted request not stored: {store_err}");
            return Err(err);
        }

        tracing::info!(path = %request.path, "request stored for background replay: {err}");
        Ok(ApiResponse::new(202, json!({ "queued": true })))
    }
}

/// Recover entity/action/payload from a dashboard POST.
///
/// Collection creates keep their body as payload; bot commands keep
/// `{id, args}` with the command name as action; bot start/stop keep `{id}`.
#[must_use]
pub fn mutation_from_request(request: &ApiRequest) -> Option<QueuedMutation> {
    if request.method != Method::Post {
        return None;
    }
    let rest = request.path.strip_prefix(DASHBOARD_API)?.trim_matches('/');
    let segments: Vec<&str> = rest.split('/').collect();
    let body = request.body.clone().unwrap_or(Value::Null);

    match segments.as_slice() {
        ["groups"] => Some(QueuedMutation::new(Entity::Group, "create", body)),
        ["accounts"] | ["bots"] => Some(QueuedMutation::new(Entity::Account, "create", body)),
        ["bots", id, "command"] => {
            let cmd = body.get("cmd").and_then(Value::as_str)?.to_string();
            let args = body
                .get("args")
                .and_then(|a| a.get("message"))
                .cloned()
                .unwrap_or(Value::Null);
            Some(QueuedMutation::new(
                Entity::Bot,
                cmd,
                json!({ "id": id_value(id), "args": args }),
            ))
        }
        ["bots", id, action @ ("start" | "stop")] => Some(QueuedMutation::new(
            Entity::Bot,
            *action,
            json!({ "id": id_value(id) }),
        )),
        _ => None,
    }
}

fn id_value(raw: &str) -> Value {
    raw.parse::<i64>().map_or_else(|_| Value::from(raw), Value::from)
}
