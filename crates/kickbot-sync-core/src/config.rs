//! Client configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sync client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Server root, e.g. `http://localhost:5000`
    pub base_url: String,
    /// Anti-forgery token sent as `X-CSRFToken`
    pub csrf_token: String,
    /// Directory holding the session document and the versioned store
    pub state_dir: PathBuf,
    /// Session document file name
    pub session_file: String,
    /// Versioned store file name
    pub versioned_db: String,
    /// Route dashboard POSTs through the background interceptor
    pub intercept_requests: bool,
    /// Dependency health poll period in seconds
    pub health_interval_secs: u64,
    /// Periodic drain period in seconds
    pub drain_interval_secs: u64,
    /// Whole-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl SyncConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With server root
    #[inline]
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// With anti-forgery token
    #[inline]
    #[must_use]
    pub fn with_csrf_token(mut self, token: impl Into<String>) -> Self {
        self.csrf_token = token.into();
        self
    }

    /// With state directory
    #[inline]
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// With background interception enabled or disabled
    #[inline]
    #[must_use]
    pub fn with_interception(mut self, enabled: bool) -> Self {
        self.intercept_requests = enabled;
        self
    }

    /// Parse TOML
    ///
    /// # Errors
    /// `ConfigError::Parse` for malformed input, `ConfigError::Invalid` for bad values
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    ///
    /// # Errors
    /// `ConfigError::Read` when the file cannot be read, otherwise as [`Self::from_toml_str`]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "base_url",
                reason: format!("expected an http(s) URL, got {:?}", self.base_url),
            });
        }
        for (field, value) in [
            ("health_interval_secs", self.health_interval_secs),
            ("drain_interval_secs", self.drain_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Session document path
    #[must_use]
    pub fn session_path(&self) -> PathBuf {
        self.state_dir.join(&self.session_file)
    }

    /// Versioned store path
    #[must_use]
    pub fn versioned_db_path(&self) -> PathBuf {
        self.state_dir.join(&self.versioned_db)
    }

    /// Health poll period
    #[inline]
    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Drain period
    #[inline]
    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    /// Request timeout
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Connect timeout
    #[inline]
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            csrf_token: String::new(),
            state_dir: PathBuf::from(".kickbot-sync"),
            session_file: "session.json".to_string(),
            versioned_db: "kickbot-sync.db".to_string(),
            intercept_requests: false,
            health_interval_secs: 10,
            drain_interval_secs: 30,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}
