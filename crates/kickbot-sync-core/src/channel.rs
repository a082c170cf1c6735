//! Live event channel
//!
//! The push channel's named events are mapped onto [`LiveEvent`] and handed to
//! one [`EventRouter`], which decides what to refetch. The transport that
//! produces events (and its reconnection policy) lives outside this crate and
//! only needs an `mpsc::Sender<LiveEvent>`.

use crate::dispatcher::{MutationDispatcher, NetworkState};
use crate::health::HealthMonitor;
use crate::reconciler::PullReconciler;
use crate::types::Entity;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveEvent {
    /// A bot process started
    BotStarted,
    /// A bot process stopped
    BotStopped,
    /// A bot process failed
    BotError,
    /// Bot status changed
    Status,
    /// Dependency health changed
    RedisStatus,
    /// An entity collection changed
    SyncEvent,
    /// Channel (re)connected
    Connect,
    /// Channel dropped
    Disconnect,
}

impl LiveEvent {
    /// Channel event name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::BotStarted => "bot_started",
            Self::BotStopped => "bot_stopped",
            Self::BotError => "bot_error",
            Self::Status => "status",
            Self::RedisStatus => "redis_status",
            Self::SyncEvent => "sync_event",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        }
    }

    /// Parse a channel event name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bot_started" => Some(Self::BotStarted),
            "bot_stopped" => Some(Self::BotStopped),
            "bot_error" => Some(Self::BotError),
            "status" => Some(Self::Status),
            "redis_status" => Some(Self::RedisStatus),
            "sync_event" => Some(Self::SyncEvent),
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Reacts to live events; every failure is logged, none propagates
#[derive(Debug)]
pub struct EventRouter {
    dispatcher: Arc<MutationDispatcher>,
    reconciler: Arc<PullReconciler>,
    health: Arc<HealthMonitor>,
    network: NetworkState,
}

impl EventRouter {
    /// Create router
    #[must_use]
    pub fn new(
        dispatcher: Arc<MutationDispatcher>,
        reconciler: Arc<PullReconciler>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let network = dispatcher.network().clone();
        Self {
            dispatcher,
            reconciler,
            health,
            network,
        }
    }

    /// Handle one event
    pub async fn handle(&self, event: LiveEvent) {
        tracing::debug!(event = event.name(), "live event");
        match event {
            LiveEvent::BotStarted | LiveEvent::BotStopped | LiveEvent::BotError | LiveEvent::Status => {
                if let Err(err) = self.reconciler.refresh(Entity::Bot).await {
                    tracing::warn!("bot refresh failed: {err}");
                }
                if let Err(err) = self.reconciler.refresh_stats().await {
                    tracing::warn!("stats refresh failed: {err}");
                }
            }
            LiveEvent::RedisStatus => {
                self.health.check().await;
            }
            LiveEvent::SyncEvent => self.pull().await,
            LiveEvent::Connect => self.on_connect().await,
            LiveEvent::Disconnect => {
                self.network.set_online(false);
            }
        }
    }

    /// Pull, drain, then health check, in that order
    pub async fn on_connect(&self) {
        self.network.set_online(true);
        self.pull().await;
        let report = self.dispatcher.drain().await;
        tracing::debug!(?report, "drain after connect");
        self.health.check().await;
    }

    async fn pull(&self) {
        if let Err(err) = self.reconciler.pull().await {
            tracing::warn!("pull failed: {err}");
        }
    }

    /// Consume events until every sender is dropped
    pub async fn run(&self, mut events: mpsc::Receiver<LiveEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        tracing::info!("live event channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_round_trip() {
        for event in [
            LiveEvent::BotStarted,
            LiveEvent::BotStopped,
            LiveEvent::BotError,
            LiveEvent::Status,
            LiveEvent::RedisStatus,
            LiveEvent::SyncEvent,
            LiveEvent::Connect,
            LiveEvent::Disconnect,
        ] {
            assert_eq!(LiveEvent::from_name(event.name()), Some(event));
        }
        assert_eq!(LiveEvent::from_name("chat_message"), None);
    }
}
