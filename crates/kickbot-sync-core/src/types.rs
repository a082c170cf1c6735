//! Core types for the sync client
//!
//! Defines the data exchanged with the server and the durable stores:
//! - Entity kinds and queued mutations
//! - Credentials
//! - Entity deltas reported by the pull endpoint
//! - Outgoing mutation requests and user-facing notices

use crate::transport::{ApiRequest, Method};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Dashboard API root shared by every collection
pub const DASHBOARD_API: &str = "/dashboard/api";

/// Entity collections the dashboard manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    /// Bot group
    Group,
    /// Chat account
    Account,
    /// Running bot bound to an account
    Bot,
}

impl Entity {
    /// Every entity, in refresh order
    pub const ALL: [Entity; 3] = [Entity::Group, Entity::Account, Entity::Bot];

    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Account => "account",
            Self::Bot => "bot",
        }
    }

    /// Parse a wire name, `None` for anything unknown
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "group" => Some(Self::Group),
            "account" => Some(Self::Account),
            "bot" => Some(Self::Bot),
            _ => None,
        }
    }

    /// Collection endpoint
    #[inline]
    #[must_use]
    pub fn collection_path(self) -> &'static str {
        match self {
            Self::Group => "/dashboard/api/groups",
            Self::Account => "/dashboard/api/accounts",
            Self::Bot => "/dashboard/api/bots",
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation waiting to be replayed against `/sync/push`
///
/// Immutable once persisted; removed only after the server accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Entity collection the mutation targets
    pub entity: Entity,
    /// `create` or a bot command name
    pub action: String,
    /// Entity/action specific body
    pub payload: Value,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Idempotency hint; the server ignores event ids it has already applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl QueuedMutation {
    /// Create a mutation stamped now with a fresh event id
    #[must_use]
    pub fn new(entity: Entity, action: impl Into<String>, payload: Value) -> Self {
        Self {
            entity,
            action: action.into(),
            payload,
            timestamp: Utc::now(),
            event_id: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Override the creation time
    #[inline]
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Ordered queue contents, insertion order significant
pub type SyncQueue = Vec<QueuedMutation>;

/// Bearer credentials kept in the session store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    /// Short-lived token sent with every request
    pub access_token: Option<String>,
    /// Token exchanged at `/auth/refresh`
    pub refresh_token: Option<String>,
}

impl Credential {
    /// Credential pair from a login
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }
}

/// Server signal that an entity collection changed
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDelta {
    /// Collection to refetch
    pub entity: Entity,
    /// Server-side action, when reported
    pub action: Option<String>,
    /// Server event id, when reported
    pub event_id: Option<String>,
    /// Server payload, when reported
    pub payload: Option<Value>,
}

impl EntityDelta {
    /// Parse one element of the pull `events` array.
    ///
    /// Returns `None` for events naming an entity this client does not project.
    #[must_use]
    pub fn from_event(event: &Value) -> Option<Self> {
        let entity = Entity::from_name(event.get("entity")?.as_str()?)?;
        Some(Self {
            entity,
            action: event.get("action").and_then(Value::as_str).map(str::to_string),
            event_id: event.get("event_id").and_then(Value::as_str).map(str::to_string),
            payload: event.get("payload").cloned(),
        })
    }
}

/// Run counters from `/dashboard/api/stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Bot runs
    #[serde(default)]
    pub runs: u64,
    /// Bot errors
    #[serde(default)]
    pub errors: u64,
}

/// Transient message for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Positive confirmation
    Success(String),
    /// Error to display
    Failure(String),
}

impl Notice {
    /// Shown when a mutation was stored for later replay
    #[must_use]
    pub fn queued_offline() -> Self {
        Self::Success("Queued offline".to_string())
    }

    /// Message text
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Success(m) | Self::Failure(m) => m,
        }
    }
}

/// An outgoing mutation plus the shape it takes when queued
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    /// HTTP method
    pub method: Method,
    /// Endpoint path
    pub path: String,
    /// Wire body
    pub body: Option<Value>,
    /// Entity recorded when queued
    pub entity: Entity,
    /// Action recorded when queued
    pub action: String,
    /// Payload recorded when queued
    pub queue_payload: Value,
    /// Whether a transport failure queues this request
    pub queueable: bool,
}

impl MutationRequest {
    /// Create a group
    #[must_use]
    pub fn create_group(name: &str, target: &str, interval: u32) -> Self {
        let data = json!({ "name": name, "target": target, "interval": interval });
        Self {
            method: Method::Post,
            path: Entity::Group.collection_path().to_string(),
            body: Some(data.clone()),
            entity: Entity::Group,
            action: "create".to_string(),
            queue_payload: data,
            queueable: true,
        }
    }

    /// Create an account inside a group
    #[must_use]
    pub fn create_account(
        username: &str,
        password: &str,
        proxy: &str,
        messages_file: &str,
        group_id: i64,
    ) -> Self {
        let data = json!({
            "username": username,
            "password": password,
            "proxy": proxy,
            "messages_file": messages_file,
            "group_id": group_id,
        });
        Self {
            method: Method::Post,
            path: Entity::Account.collection_path().to_string(),
            body: Some(data.clone()),
            entity: Entity::Account,
            action: "create".to_string(),
            queue_payload: data,
            queueable: true,
        }
    }

    /// Send a command to a running bot.
    ///
    /// The wire body is `{cmd, args: {message}}`; the queued payload is `{id, args}`.
    #[must_use]
    pub fn bot_command(bot_id: i64, cmd: &str, message: &str) -> Self {
        Self {
            method: Method::Post,
            path: format!("{DASHBOARD_API}/bots/{bot_id}/command"),
            body: Some(json!({ "cmd": cmd, "args": { "message": message } })),
            entity: Entity::Bot,
            action: cmd.to_string(),
            queue_payload: json!({ "id": bot_id, "args": message }),
            queueable: true,
        }
    }

    /// Delete a group with its accounts; never queued
    #[must_use]
    pub fn delete_group(group_id: i64) -> Self {
        Self {
            method: Method::Delete,
            path: format!("{DASHBOARD_API}/groups/{group_id}"),
            body: None,
            entity: Entity::Group,
            action: "delete".to_string(),
            queue_payload: json!({ "id": group_id }),
            queueable: false,
        }
    }

    /// Delete a bot; never queued
    #[must_use]
    pub fn delete_bot(bot_id: i64) -> Self {
        Self {
            method: Method::Delete,
            path: format!("{DASHBOARD_API}/bots/{bot_id}"),
            body: None,
            entity: Entity::Bot,
            action: "delete".to_string(),
            queue_payload: json!({ "id": bot_id }),
            queueable: false,
        }
    }

    /// Request sent to the server
    #[must_use]
    pub fn to_api_request(&self) -> ApiRequest {
        let mut request = ApiRequest::new(self.method, self.path.clone());
        request.body = self.body.clone();
        request
    }

    /// Record appended to the durable queue
    #[must_use]
    pub fn to_queued(&self) -> QueuedMutation {
        QueuedMutation::new(self.entity, self.action.clone(), self.queue_payload.clone())
    }

    /// Collections whose projection is stale after a delivered mutation
    #[must_use]
    pub fn refreshes(&self) -> &'static [Entity] {
        match (self.entity, self.method) {
            (Entity::Group, Method::Delete) => &Entity::ALL,
            (Entity::Group, _) => &[Entity::Group],
            (Entity::Account, _) => &[Entity::Account, Entity::Bot],
            (Entity::Bot, Method::Delete) => &[Entity::Bot, Entity::Account],
            (Entity::Bot, _) => &[],
        }
    }

    /// Confirmation for a delivered mutation, given the response body
    #[must_use]
    pub fn success_notice(&self, body: &Value) -> Option<Notice> {
        match (self.entity, self.method) {
            (_, Method::Delete) => body
                .get("message")
                .and_then(Value::as_str)
                .map(|m| Notice::Success(m.to_string())),
            (Entity::Group, _) => Some(Notice::Success("Group created".to_string())),
            (Entity::Account, _) => Some(Notice::Success("Account created".to_string())),
            (Entity::Bot, _) => (body.get("status").and_then(Value::as_str) == Some("ok"))
                .then(|| Notice::Success("Command queued".to_string())),
        }
    }
}
