//! Auth gate
//!
//! Decorates every request with the bearer and anti-forgery headers and owns
//! the refresh state machine:
//!
//! ```text
//! Authorized --401--> Refreshing --ok--> Authorized   (request re-issued once)
//!                               \--fail--> Unauthenticated (original 401 returned)
//! Unauthenticated --set_credentials--> Authorized
//! ```
//!
//! A request is retried at most once; a 401 on the retry goes back to the caller.

use crate::dashboard::Dashboard;
use crate::error::{StoreError, TransportError};
use crate::store::CredentialStore;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Method, AUTHORIZATION};
use crate::types::Credential;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Anti-forgery header name
pub const CSRF_HEADER: &str = "X-CSRFToken";

/// Token refresh endpoint
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    /// Requests go out with the stored access token
    Authorized,
    /// A refresh call is in flight
    Refreshing,
    /// Refresh failed; the user has to log in again
    Unauthenticated,
}

/// Allowed successor states
#[must_use]
pub fn allowed_transitions(from: AuthState) -> &'static [AuthState] {
    use AuthState::{Authorized, Refreshing, Unauthenticated};
    match from {
        Authorized => &[Refreshing, Unauthenticated],
        Refreshing => &[Authorized, Unauthenticated],
        Unauthenticated => &[Authorized],
    }
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

/// Wraps a transport with credentials and the single refresh-and-retry
pub struct AuthGate {
    transport: Arc<dyn HttpTransport>,
    credentials: CredentialStore,
    csrf_token: String,
    dashboard: Arc<dyn Dashboard>,
    state: Mutex<AuthState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    /// Create a gate in the `Authorized` state
    #[must_use]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: CredentialStore,
        csrf_token: impl Into<String>,
        dashboard: Arc<dyn Dashboard>,
    ) -> Self {
        Self {
            transport,
            credentials,
            csrf_token: csrf_token.into(),
            dashboard,
            state: Mutex::new(AuthState::Authorized),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> AuthState {
        *self.state.lock()
    }

    /// Credential store used by the gate
    #[inline]
    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Store a fresh credential pair (after login) and become `Authorized`
    ///
    /// # Errors
    /// `StoreError` when the session document cannot be written
    pub async fn set_credentials(&self, credential: &Credential) -> Result<(), StoreError> {
        self.credentials.store(credential).await?;
        self.transition(AuthState::Authorized);
        Ok(())
    }

    /// Send a request with credentials, refreshing once on 401.
    ///
    /// Unauthorized outcomes are returned as the 401 response, not as an error.
    ///
    /// # Errors
    /// `TransportError` when no response was obtained
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let _busy = BusyIndicator::show(self.dashboard.as_ref());
        self.send_authorized(request).await
    }

    async fn send_authorized(&self, mut request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let used_token = self.credentials.load().await.access_token;
        self.decorate(&mut request, used_token.as_deref());

        let response = self.transport.send(&request).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        if self.state() == AuthState::Unauthenticated {
            tracing::debug!(path = %request.path, "unauthorized while unauthenticated, not refreshing");
            return Ok(response);
        }

        let Some(token) = self.refresh(used_token.as_deref()).await else {
            return Ok(response);
        };

        self.decorate(&mut request, Some(&token));
        let retry = self.transport.send(&request).await?;
        if retry.is_unauthorized() {
            tracing::warn!(path = %request.path, "still unauthorized after token refresh");
        }
        Ok(retry)
    }

    fn decorate(&self, request: &mut ApiRequest, access_token: Option<&str>) {
        request.set_header(CSRF_HEADER, self.csrf_token.clone());
        if let Some(token) = access_token {
            request.set_header(AUTHORIZATION, bearer(token));
        }
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// `stale` is the access token the failed request carried; if another
    /// request already replaced it, the replacement is reused without a call.
    async fn refresh(&self, stale: Option<&str>) -> Option<String> {
        let _guard = self.refresh_lock.lock().await;

        if self.state() == AuthState::Unauthenticated {
            return None;
        }
        let current = self.credentials.load().await;
        if let Some(token) = current.access_token.as_deref() {
            if Some(token) != stale {
                tracing::debug!("access token rotated by a concurrent refresh");
                return Some(token.to_string());
            }
        }

        self.transition(AuthState::Refreshing);

        let Some(refresh_token) = current.refresh_token else {
            tracing::info!("no refresh token stored");
            self.transition(AuthState::Unauthenticated);
            return None;
        };

        let request = ApiRequest::new(Method::Post, REFRESH_PATH)
            .with_header(AUTHORIZATION, bearer(&refresh_token));
        let token = match self.transport.send(&request).await {
            Ok(response) if response.is_success() => response
                .body
                .get("access_token")
                .and_then(Value::as_str)
                .map(str::to_string),
            Ok(response) => {
                tracing::warn!(status = response.status, "token refresh rejected");
                None
            }
            Err(err) => {
                tracing::warn!("token refresh failed: {err}");
                None
            }
        };

        let Some(token) = token else {
            self.transition(AuthState::Unauthenticated);
            return None;
        };

        if let Err(err) = self.credentials.set_access_token(&token).await {
            tracing::error!("refreshed access token not persisted: {err}");
        }
        self.transition(AuthState::Authorized);
        Some(token)
    }

    fn transition(&self, to: AuthState) {
        let mut state = self.state.lock();
        let from = *state;
        if from == to {
            return;
        }
        debug_assert!(
            allowed_transitions(from).contains(&to),
            "illegal auth transition {from:?} -> {to:?}"
        );
        tracing::info!(?from, ?to, "auth state changed");
        *state = to;
    }
}

/// Keeps the busy indicator up until dropped, including when the send
/// future is cancelled
struct BusyIndicator<'a> {
    dashboard: &'a dyn Dashboard,
}

impl<'a> BusyIndicator<'a> {
    fn show(dashboard: &'a dyn Dashboard) -> Self {
        dashboard.set_busy(true);
        Self { dashboard }
    }
}

impl Drop for BusyIndicator<'_> {
    fn drop(&mut self) {
        self.dashboard.set_busy(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::MockDashboard;
    use crate::store::SessionStorage;
    use crate::transport::MockHttpTransport;
    use mockall::predicate::always;
    use serde_json::json;

    fn quiet_dashboard() -> Arc<MockDashboard> {
        let mut dashboard = MockDashboard::new();
        dashboard.expect_set_busy().returning(|_| ());
        Arc::new(dashboard)
    }

    async fn credentials(dir: &tempfile::TempDir, credential: Credential) -> CredentialStore {
        let store = CredentialStore::new(Arc::new(SessionStorage::open(dir.path().join("s.json"))));
        store.store(&credential).await.unwrap();
        store
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        assert!(allowed_transitions(AuthState::Authorized).contains(&AuthState::Refreshing));
        assert!(allowed_transitions(AuthState::Refreshing).contains(&AuthState::Authorized));
        assert!(!allowed_transitions(AuthState::Unauthenticated).contains(&AuthState::Refreshing));
    }

    #[tokio::test]
    async fn decorates_with_bearer_and_csrf() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockHttpTransport::new();
        transport
            .expect_send()
            .withf(|req| {
                req.header(AUTHORIZATION) == Some("Bearer a1")
                    && req.header(CSRF_HEADER) == Some("csrf")
            })
            .times(1)
            .returning(|_| Ok(ApiResponse::new(200, json!({"ok": true}))));

        let gate = AuthGate::new(
            Arc::new(transport),
            credentials(&dir, Credential::new("a1", "r1")).await,
            "csrf",
            quiet_dashboard(),
        );
        let response = gate.send(ApiRequest::get("/dashboard/api/groups")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(gate.state(), AuthState::Authorized);
    }

    #[tokio::test]
    async fn busy_indicator_wraps_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockHttpTransport::new();
        transport
            .expect_send()
            .returning(|_| Err(TransportError::Connect("refused".to_string())));

        let mut dashboard = MockDashboard::new();
        let mut seq = mockall::Sequence::new();
        dashboard
            .expect_set_busy()
            .with(mockall::predicate::eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());
        dashboard
            .expect_set_busy()
            .with(mockall::predicate::eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());

        let gate = AuthGate::new(
            Arc::new(transport),
            credentials(&dir, Credential::default()).await,
            "csrf",
            Arc::new(dashboard),
        );
        assert!(gate.send(ApiRequest::get("/x")).await.is_err());
    }

    struct StalledTransport;

    #[async_trait::async_trait]
    impl HttpTransport for StalledTransport {
        async fn send(&self, _request: &ApiRequest) -> Result<ApiResponse, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn busy_indicator_clears_when_send_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut dashboard = MockDashboard::new();
        let mut seq = mockall::Sequence::new();
        dashboard
            .expect_set_busy()
            .with(mockall::predicate::eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());
        dashboard
            .expect_set_busy()
            .with(mockall::predicate::eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());

        let gate = AuthGate::new(
            Arc::new(StalledTransport),
            credentials(&dir, Credential::new("a1", "r1")).await,
            "csrf",
            Arc::new(dashboard),
        );
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            gate.send(ApiRequest::get("/dashboard/api/groups")),
        )
        .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn missing_refresh_token_surfaces_original_401() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockHttpTransport::new();
        transport
            .expect_send()
            .with(always())
            .times(1)
            .returning(|_| Ok(ApiResponse::new(401, json!({"msg": "expired"}))));

        let store = CredentialStore::new(Arc::new(SessionStorage::open(dir.path().join("s.json"))));
        let gate = AuthGate::new(Arc::new(transport), store, "csrf", quiet_dashboard());

        let response = gate.send(ApiRequest::get("/sync/pull")).await.unwrap();
        assert_eq!(response, ApiResponse::new(401, json!({"msg": "expired"})));
        assert_eq!(gate.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn set_credentials_leaves_unauthenticated() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockHttpTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(ApiResponse::new(401, json!({}))));

        let store = CredentialStore::new(Arc::new(SessionStorage::open(dir.path().join("s.json"))));
        let gate = AuthGate::new(Arc::new(transport), store, "csrf", quiet_dashboard());
        let _ = gate.send(ApiRequest::get("/x")).await.unwrap();
        assert_eq!(gate.state(), AuthState::Unauthenticated);

        gate.set_credentials(&Credential::new("a", "r")).await.unwrap();
        assert_eq!(gate.state(), AuthState::Authorized);
        assert_eq!(gate.credentials().load().await, Credential::new("a", "r"));
    }
}
