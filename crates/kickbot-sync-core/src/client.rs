//! Sync client
//!
//! Wires the gate, dispatcher, reconciler, health monitor and event router
//! over one session document and one versioned store, and runs the periodic
//! triggers.

use crate::auth::{AuthGate, AuthState};
use crate::channel::{EventRouter, LiveEvent};
use crate::config::SyncConfig;
use crate::dashboard::Dashboard;
use crate::dispatcher::{Dispatched, DrainReport, MutationDispatcher, NetworkState};
use crate::error::SyncError;
use crate::health::HealthMonitor;
use crate::interceptor::Interceptor;
use crate::reconciler::PullReconciler;
use crate::store::{CredentialStore, QueueStore, SessionQueueStore, SessionStorage, VersionedQueueStore};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::types::{Credential, EntityDelta, MutationRequest, Notice};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Periodic tasks spawned by [`SyncClient::spawn_background`]; aborted on drop
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Number of running tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// No tasks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every task
    pub fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Client-side write sync facade
pub struct SyncClient {
    config: SyncConfig,
    gate: Arc<AuthGate>,
    dispatcher: Arc<MutationDispatcher>,
    reconciler: Arc<PullReconciler>,
    health: Arc<HealthMonitor>,
    router: Arc<EventRouter>,
    dashboard: Arc<dyn Dashboard>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("base_url", &self.config.base_url)
            .field("auth", &self.gate.state())
            .field("online", &self.network().is_online())
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    /// Open the on-disk state named by `config` and connect to its server
    ///
    /// # Errors
    /// `SyncError::Config` for invalid configuration, `SyncError::Store` when
    /// the versioned store cannot be opened
    pub fn open(config: SyncConfig, dashboard: Arc<dyn Dashboard>) -> Result<Self, SyncError> {
        config.validate()?;
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
            &config.base_url,
            config.request_timeout(),
            config.connect_timeout(),
        ));
        let session = Arc::new(SessionStorage::open(config.session_path()));
        let versioned: Arc<dyn QueueStore> =
            Arc::new(VersionedQueueStore::open(&config.versioned_db_path())?);

        tracing::info!(
            base_url = %config.base_url,
            state_dir = %config.state_dir.display(),
            intercept = config.intercept_requests,
            "sync client opened"
        );
        Ok(Self::from_parts(config, transport, session, versioned, dashboard))
    }

    /// Assemble from explicit parts
    #[must_use]
    pub fn from_parts(
        config: SyncConfig,
        transport: Arc<dyn HttpTransport>,
        session: Arc<SessionStorage>,
        versioned: Arc<dyn QueueStore>,
        dashboard: Arc<dyn Dashboard>,
    ) -> Self {
        let network = NetworkState::default();
        let gated: Arc<dyn HttpTransport> = if config.intercept_requests {
            Arc::new(Interceptor::new(Arc::clone(&transport), Arc::clone(&versioned)))
        } else {
            Arc::clone(&transport)
        };

        let gate = Arc::new(AuthGate::new(
            gated,
            CredentialStore::new(Arc::clone(&session)),
            config.csrf_token.clone(),
            Arc::clone(&dashboard),
        ));
        let primary: Arc<dyn QueueStore> = Arc::new(SessionQueueStore::new(session));
        let dispatcher = Arc::new(
            MutationDispatcher::new(Arc::clone(&gate), primary, network).with_drain_source(versioned),
        );
        let reconciler = Arc::new(PullReconciler::new(Arc::clone(&gate), Arc::clone(&dashboard)));
        let health = Arc::new(HealthMonitor::new(transport, Arc::clone(&dashboard)));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&dispatcher),
            Arc::clone(&reconciler),
            Arc::clone(&health),
        ));

        Self {
            config,
            gate,
            dispatcher,
            reconciler,
            health,
            router,
            dashboard,
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Dispatcher
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<MutationDispatcher> {
        &self.dispatcher
    }

    /// Reconciler
    #[must_use]
    pub fn reconciler(&self) -> &Arc<PullReconciler> {
        &self.reconciler
    }

    /// Network belief
    #[must_use]
    pub fn network(&self) -> &NetworkState {
        self.dispatcher.network()
    }

    /// Auth gate state
    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.gate.state()
    }

    /// Store credentials obtained from a login
    ///
    /// # Errors
    /// `SyncError::Store` when the session document cannot be written
    pub async fn login(&self, credential: &Credential) -> Result<(), SyncError> {
        self.gate.set_credentials(credential).await?;
        Ok(())
    }

    /// Submit a user mutation.
    ///
    /// Delivered: refetch affected collections, confirm, then run the
    /// post-submit drain. Queued: "Queued offline". Errors are shown and
    /// returned.
    ///
    /// # Errors
    /// As [`MutationDispatcher::dispatch`]
    pub async fn submit(&self, request: MutationRequest) -> Result<Dispatched, SyncError> {
        match self.dispatcher.dispatch(&request).await {
            Ok(Dispatched::Delivered(body)) => {
                for entity in request.refreshes() {
                    if let Err(err) = self.reconciler.refresh(*entity).await {
                        tracing::warn!(%entity, "refresh after submit failed: {err}");
                    }
                }
                if let Some(notice) = request.success_notice(&body) {
                    self.dashboard.notify(&notice);
                }
                let report = self.dispatcher.drain().await;
                tracing::debug!(?report, "post-submit drain");
                Ok(Dispatched::Delivered(body))
            }
            Ok(queued) => {
                self.dashboard.notify(&Notice::queued_offline());
                Ok(queued)
            }
            Err(err) => {
                self.dashboard.notify(&Notice::Failure(err.to_string()));
                Err(err)
            }
        }
    }

    /// Drain trigger
    pub async fn drain(&self) -> DrainReport {
        self.dispatcher.drain().await
    }

    /// Pull trigger
    ///
    /// # Errors
    /// As [`PullReconciler::pull`]
    pub async fn pull(&self) -> Result<Vec<EntityDelta>, SyncError> {
        self.reconciler.pull().await
    }

    /// Health check trigger
    pub async fn check_health(&self) -> Option<bool> {
        self.health.check().await
    }

    /// Route one live event
    pub async fn handle_event(&self, event: LiveEvent) {
        self.router.handle(event).await;
    }

    /// Initial load: every collection, stats, then the connect sequence
    pub async fn start(&self) {
        self.reconciler.refresh_all().await;
        if let Err(err) = self.reconciler.refresh_stats().await {
            tracing::warn!("stats load failed: {err}");
        }
        self.router.on_connect().await;
    }

    /// Consume live events on a new task
    #[must_use]
    pub fn spawn_event_loop(&self, events: mpsc::Receiver<LiveEvent>) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        tokio::spawn(async move { router.run(events).await })
    }

    /// Start the health poll and the periodic drain.
    ///
    /// First ticks fire one period from now; [`Self::start`] covers time zero.
    #[must_use]
    pub fn spawn_background(&self) -> BackgroundTasks {
        let health = Arc::clone(&self.health);
        let health_period = self.config.health_interval();
        let health_task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + health_period, health_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                health.check().await;
            }
        });

        let dispatcher = Arc::clone(&self.dispatcher);
        let drain_period = self.config.drain_interval();
        let drain_task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + drain_period, drain_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = dispatcher.drain().await;
                tracing::trace!(?report, "periodic drain");
            }
        });

        BackgroundTasks {
            handles: vec![health_task, drain_task],
        }
    }
}
