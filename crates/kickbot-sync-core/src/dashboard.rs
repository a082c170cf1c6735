//! View collaborator
//!
//! The sync core never renders anything itself; it hands authoritative data
//! and notices to a [`Dashboard`].

use crate::types::{Entity, Notice, Stats};
use serde_json::Value;

/// Projection of server state for the user
#[cfg_attr(test, mockall::automock)]
pub trait Dashboard: Send + Sync {
    /// Replace the projection of one collection
    fn render_collection(&self, entity: Entity, items: &[Value]);

    /// Replace the run counters
    fn render_stats(&self, _stats: &Stats) {}

    /// Show or hide the dependency-down banner
    fn set_dependency_health(&self, _redis_online: bool) {}

    /// Transient message
    fn notify(&self, _notice: &Notice) {}

    /// Busy indicator around every gated request
    fn set_busy(&self, _busy: bool) {}
}

/// Dashboard that discards everything, for headless contexts
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessDashboard;

impl Dashboard for HeadlessDashboard {
    fn render_collection(&self, entity: Entity, items: &[Value]) {
        tracing::trace!(%entity, count = items.len(), "collection refreshed");
    }
}
