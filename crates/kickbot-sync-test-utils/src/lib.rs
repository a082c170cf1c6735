//! Testing utilities for the kickbot-sync workspace
//!
//! Scripted transport, recording dashboard and a ready-wired client harness.

#![allow(missing_docs)]

use async_trait::async_trait;
use kickbot_sync_core::store::{QueueStore, SessionStorage, VersionedQueueStore};
use kickbot_sync_core::{
    ApiRequest, ApiResponse, Credential, Dashboard, Entity, HttpTransport, Method, Notice,
    QueuedMutation, Stats, SyncClient, SyncConfig, SyncQueue, TransportError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub enum Reply {
    Respond(ApiResponse),
    Fail(TransportError),
}

#[derive(Debug, Default)]
struct Route {
    replies: VecDeque<Reply>,
    hold: Option<Arc<Notify>>,
}

/// Transport answering from per-route scripts.
///
/// Replies for a route are consumed in order; the last one repeats.
/// Unscripted routes fail with a connect error.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(Method, String), Route>>,
    log: Mutex<Vec<ApiRequest>>,
    offline: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, method: Method, path: &str, reply: Reply) -> &Self {
        self.routes
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .replies
            .push_back(reply);
        self
    }

    pub fn ok(&self, method: Method, path: &str, body: Value) -> &Self {
        self.reply(method, path, 200, body)
    }

    pub fn reply(&self, method: Method, path: &str, status: u16, body: Value) -> &Self {
        self.push_reply(method, path, Reply::Respond(ApiResponse::new(status, body)))
    }

    pub fn fail(&self, method: Method, path: &str, err: TransportError) -> &Self {
        self.push_reply(method, path, Reply::Fail(err))
    }

    /// Block every call on a route until the returned handle is notified
    pub fn hold(&self, method: Method, path: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.routes
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .hold = Some(Arc::clone(&notify));
        notify
    }

    /// Fail every request with a connect error while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<ApiRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    pub fn calls(&self, method: Method, path: &str) -> usize {
        self.requests_to(method, path).len()
    }

    pub fn total_calls(&self) -> usize {
        self.log.lock().len()
    }

    fn next_reply(&self, request: &ApiRequest) -> (Option<Arc<Notify>>, Reply) {
        let mut routes = self.routes.lock();
        let Some(route) = routes.get_mut(&(request.method, request.path.clone())) else {
            return (
                None,
                Reply::Fail(TransportError::Connect(format!(
                    "no script for {} {}",
                    request.method, request.path
                ))),
            );
        };
        let reply = if route.replies.len() > 1 {
            route.replies.pop_front()
        } else {
            route.replies.front().cloned()
        };
        let reply = reply.unwrap_or_else(|| {
            Reply::Fail(TransportError::Connect("route has no replies".into()))
        });
        (route.hold.clone(), reply)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.log.lock().push(request.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("scripted offline".into()));
        }

        let (hold, reply) = self.next_reply(request);
        if let Some(hold) = hold {
            hold.notified().await;
        }
        match reply {
            Reply::Respond(response) => Ok(response),
            Reply::Fail(err) => Err(err),
        }
    }
}

/// Dashboard that records everything it is handed
#[derive(Debug, Default)]
pub struct RecordingDashboard {
    renders: Mutex<Vec<(Entity, Vec<Value>)>>,
    stats: Mutex<Vec<Stats>>,
    notices: Mutex<Vec<Notice>>,
    health: Mutex<Vec<bool>>,
    busy: Mutex<Vec<bool>>,
}

impl RecordingDashboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renders(&self) -> Vec<(Entity, Vec<Value>)> {
        self.renders.lock().clone()
    }

    pub fn render_count(&self, entity: Entity) -> usize {
        self.renders.lock().iter().filter(|(e, _)| *e == entity).count()
    }

    pub fn stats(&self) -> Vec<Stats> {
        self.stats.lock().clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    pub fn health(&self) -> Vec<bool> {
        self.health.lock().clone()
    }

    pub fn busy(&self) -> Vec<bool> {
        self.busy.lock().clone()
    }
}

impl Dashboard for RecordingDashboard {
    fn render_collection(&self, entity: Entity, items: &[Value]) {
        self.renders.lock().push((entity, items.to_vec()));
    }

    fn render_stats(&self, stats: &Stats) {
        self.stats.lock().push(*stats);
    }

    fn set_dependency_health(&self, redis_online: bool) {
        self.health.lock().push(redis_online);
    }

    fn notify(&self, notice: &Notice) {
        self.notices.lock().push(notice.clone());
    }

    fn set_busy(&self, busy: bool) {
        self.busy.lock().push(busy);
    }
}

/// Client wired to a scripted transport, a recording dashboard, a session
/// document in a temp dir and an in-memory versioned store
pub struct Harness {
    pub dir: TempDir,
    pub transport: Arc<ScriptedTransport>,
    pub dashboard: Arc<RecordingDashboard>,
    pub session: Arc<SessionStorage>,
    pub background: Arc<VersionedQueueStore>,
    pub client: SyncClient,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(adjust: impl FnOnce(SyncConfig) -> SyncConfig) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = adjust(
            SyncConfig::new()
                .with_state_dir(dir.path())
                .with_csrf_token("csrf-test"),
        );
        let transport = Arc::new(ScriptedTransport::new());
        let dashboard = Arc::new(RecordingDashboard::new());
        let session = Arc::new(SessionStorage::open(config.session_path()));
        let background = Arc::new(VersionedQueueStore::open_in_memory().expect("in-memory db"));

        let client = SyncClient::from_parts(
            config,
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
            Arc::clone(&session),
            Arc::clone(&background) as Arc<dyn QueueStore>,
            Arc::clone(&dashboard) as Arc<dyn Dashboard>,
        );

        Self {
            dir,
            transport,
            dashboard,
            session,
            background,
            client,
        }
    }

    pub async fn with_tokens(access: &str, refresh: &str) -> Self {
        let harness = Self::new();
        harness
            .client
            .login(&Credential::new(access, refresh))
            .await
            .expect("store credentials");
        harness
    }

    /// Everything pending in the session queue
    pub async fn session_queue(&self) -> SyncQueue {
        kickbot_sync_core::SessionQueueStore::new(Arc::clone(&self.session))
            .load()
            .await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn mutation(entity: Entity, action: &str, payload: Value) -> QueuedMutation {
    QueuedMutation::new(entity, action, payload)
}
