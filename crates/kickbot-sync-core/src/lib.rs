//! Kickbot Sync Core - offline-tolerant write sync for the Kickbot dashboard
//!
//! The client-side half of the sync system:
//! - Dispatches user mutations, queueing them durably when the server is unreachable
//! - Drains queued mutations in order through `/sync/push`
//! - Refetches collections when `/sync/pull` or the live channel reports changes
//! - Refreshes the access token once on 401 and retries the request
//! - Optionally intercepts dashboard POSTs in a background store
//!
//! # Example
//!
//! ```rust,ignore
//! use kickbot_sync_core::{HeadlessDashboard, MutationRequest, SyncClient, SyncConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), kickbot_sync_core::SyncError> {
//! let config = SyncConfig::new().with_base_url("http://localhost:5000");
//! let client = SyncClient::open(config, Arc::new(HeadlessDashboard))?;
//!
//! client.start().await;
//! let _tasks = client.spawn_background();
//!
//! client.submit(MutationRequest::create_group("G1", "channel", 60)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod interceptor;
pub mod reconciler;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use auth::{AuthGate, AuthState};
pub use channel::{EventRouter, LiveEvent};
pub use client::{BackgroundTasks, SyncClient};
pub use config::SyncConfig;
pub use dashboard::{Dashboard, HeadlessDashboard};
pub use dispatcher::{Dispatched, DrainReport, MutationDispatcher, NetworkState};
pub use error::{ConfigError, StoreError, SyncError, TransportError};
pub use health::HealthMonitor;
pub use interceptor::Interceptor;
pub use reconciler::PullReconciler;
pub use store::{
    CredentialStore, QueueStore, SessionQueueStore, SessionStorage, VersionedQueueStore,
};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, ReqwestTransport};
pub use types::{
    Credential, Entity, EntityDelta, MutationRequest, Notice, QueuedMutation, Stats, SyncQueue,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding the sync client
    pub use crate::{
        Credential, Dashboard, Dispatched, DrainReport, Entity, LiveEvent, MutationRequest,
        Notice, SyncClient, SyncConfig, SyncError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::dashboard::MockDashboard;
    use crate::transport::MockHttpTransport;
    use std::sync::Arc;

    fn client_over(
        transport: MockHttpTransport,
        dashboard: MockDashboard,
        dir: &tempfile::TempDir,
    ) -> SyncClient {
        let config = SyncConfig::new().with_state_dir(dir.path());
        let session = Arc::new(SessionStorage::open(config.session_path()));
        let versioned: Arc<dyn QueueStore> =
            Arc::new(VersionedQueueStore::open_in_memory().unwrap());
        SyncClient::from_parts(
            config,
            Arc::new(transport),
            session,
            versioned,
            Arc::new(dashboard),
        )
    }

    #[tokio::test]
    async fn unreachable_submit_is_queued_and_announced() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockHttpTransport::new();
        transport
            .expect_send()
            .returning(|_| Err(TransportError::Connect("refused".into())));
        let mut dashboard = MockDashboard::new();
        dashboard.expect_set_busy().returning(|_| ());
        dashboard
            .expect_notify()
            .withf(|notice| *notice == Notice::queued_offline())
            .times(1)
            .returning(|_| ());

        let client = client_over(transport, dashboard, &dir);
        let outcome = client
            .submit(MutationRequest::create_group("G1", "chan", 60))
            .await
            .unwrap();

        assert!(matches!(outcome, Dispatched::Queued(_)));
        assert_eq!(client.dispatcher().pending().await.len(), 1);
    }

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
