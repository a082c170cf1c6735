//! Error types for the sync core
//!
//! Mirrors the failure taxonomy of the client:
//! - Transport failures (no response) are recoverable by queueing
//! - Auth failures are recovered by one refresh, then surfaced
//! - Domain errors come back from the server and are shown verbatim
//! - Store corruption never reaches this type; it degrades to an empty queue

/// Main sync error type
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No response from the server
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Server answered with an `error` field
    #[error("{0}")]
    Domain(String),

    /// Unauthorized after the single refresh-and-retry
    #[error("unauthenticated")]
    Unauthenticated,

    /// Non-success status without a domain error body
    #[error("unexpected status {status}")]
    Http { status: u16 },

    /// Response body did not have the expected shape
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Only transport failures may be replayed later
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// The caller is expected to send the user back to login
    #[inline]
    #[must_use]
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Unauthenticated)
    }
}

/// Failure to obtain any response at all
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// Request exceeded its deadline
    #[error("request timed out")]
    Timeout,

    /// Client knows the network is down
    #[error("network offline")]
    Offline,

    /// Anything else reported by the HTTP stack
    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// Durable store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Encoding failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blocking task panicked or was cancelled
    #[error("store task failed: {0}")]
    Task(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`crate::SyncConfig`]
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
