//! Dependency health check against `/dashboard/api/status`

use crate::dashboard::Dashboard;
use crate::transport::{ApiRequest, HttpTransport};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Dependency status endpoint
pub const STATUS_PATH: &str = "/dashboard/api/status";

/// Polls the server's dependency status and drives the banner
pub struct HealthMonitor {
    transport: Arc<dyn HttpTransport>,
    dashboard: Arc<dyn Dashboard>,
    last: Mutex<Option<bool>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("last", &*self.last.lock())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create monitor; the status endpoint is called without credentials
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>, dashboard: Arc<dyn Dashboard>) -> Self {
        Self {
            transport,
            dashboard,
            last: Mutex::new(None),
        }
    }

    /// Fetch the status once.
    ///
    /// Returns `None` and leaves the banner alone when the server could not
    /// be asked; a missing flag counts as offline.
    pub async fn check(&self) -> Option<bool> {
        let response = match self.transport.send(&ApiRequest::get(STATUS_PATH)).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                tracing::debug!(status = response.status, "status check rejected");
                return None;
            }
            Err(err) => {
                tracing::debug!("status check failed: {err}");
                return None;
            }
        };

        let redis_online = response
            .body
            .get("redis_online")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let previous = self.last.lock().replace(redis_online);
        if previous != Some(redis_online) {
            if redis_online {
                tracing::info!("dependency healthy");
            } else {
                tracing::warn!("dependency offline");
            }
        }
        self.dashboard.set_dependency_health(redis_online);
        Some(redis_online)
    }

    /// Result of the last successful check
    #[must_use]
    pub fn last(&self) -> Option<bool> {
        *self.last.lock()
    }
}
