//! Session manager.
//!
//! Owns the authentication lifecycle: login, logout, startup restore, and
//! the forced transition when the backend answers 401 on an authenticated
//! route. Token and identity always move together: one struct behind one
//! lock, swapped whole, so no observer can ever see a token without its
//! identity.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cartella_api_types::{AuthRequest, AuthResponse, Identity};
use metrics::counter;
use reqwest::{RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::QueryCache;
use crate::infra::storage::{PersistedSession, TokenStore};
use crate::transport::{RequestStage, ResponseObserver, Scope, Transport, TransportError};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "session";

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Before `restore_on_startup` has run.
    Uninitialized,
    /// Startup restore in progress.
    Loading,
    Anonymous,
    Authenticated,
}

/// Immutable snapshot of the session, broadcast to subscribers on change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub phase: SessionPhase,
    pub token: Option<String>,
    pub identity: Option<Identity>,
}

impl Session {
    fn uninitialized() -> Self {
        Self {
            phase: SessionPhase::Uninitialized,
            token: None,
            identity: None,
        }
    }

    fn anonymous() -> Self {
        Self {
            phase: SessionPhase::Anonymous,
            token: None,
            identity: None,
        }
    }

    fn authenticated(token: String, identity: Identity) -> Self {
        Self {
            phase: SessionPhase::Authenticated,
            token: Some(token),
            identity: Some(identity),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
            && self.token.is_some()
            && self.identity.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.phase == SessionPhase::Loading
    }
}

/// Shared session state: the current snapshot plus two broadcast channels,
/// one for session changes and one for forced-logout redirect signals.
pub struct SessionState {
    current: RwLock<Session>,
    sessions: watch::Sender<Session>,
    redirects: watch::Sender<u64>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let initial = Session::uninitialized();
        let (sessions, _) = watch::channel(initial.clone());
        let (redirects, _) = watch::channel(0);
        Self {
            current: RwLock::new(initial),
            sessions,
            redirects,
        }
    }

    pub fn snapshot(&self) -> Session {
        rw_read(&self.current, SOURCE, "snapshot").clone()
    }

    pub fn bearer_token(&self) -> Option<String> {
        rw_read(&self.current, SOURCE, "bearer_token").token.clone()
    }

    /// Watch stream of session snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.sessions.subscribe()
    }

    /// Watch stream of redirect signals. The value is a counter; each forced
    /// logout increments it exactly once.
    pub fn redirects(&self) -> watch::Receiver<u64> {
        self.redirects.subscribe()
    }

    fn replace(&self, next: Session) -> Session {
        let previous = {
            let mut current = rw_write(&self.current, SOURCE, "replace");
            std::mem::replace(&mut *current, next.clone())
        };
        self.sessions.send_replace(next);
        previous
    }

    fn set_loading(&self) {
        self.replace(Session {
            phase: SessionPhase::Loading,
            token: None,
            identity: None,
        });
    }

    fn install(&self, token: String, identity: Identity) {
        self.replace(Session::authenticated(token, identity));
    }

    /// Swap in the anonymous session, returning what was there before. The
    /// swap is the atomic point deciding who performs forced-logout work.
    fn clear(&self) -> Session {
        self.replace(Session::anonymous())
    }

    fn signal_redirect(&self) {
        self.redirects.send_modify(|count| *count += 1);
    }
}

/// Login failure. The session is left exactly as it was.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    BadCredentials,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected login response: {0}")]
    Envelope(String),
}

impl From<TransportError> for AuthError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized => Self::BadCredentials,
            TransportError::Http(err) => Self::Network(err.to_string()),
            TransportError::Url(err) => Self::Network(err.to_string()),
            TransportError::Rejected { message, .. } => Self::Envelope(message),
            TransportError::Envelope(message) => Self::Envelope(message),
        }
    }
}

/// Drives session transitions and keeps the token store and query cache in
/// step with them.
pub struct SessionManager {
    state: Arc<SessionState>,
    store: Arc<dyn TokenStore>,
    cache: QueryCache,
}

impl SessionManager {
    pub fn new(state: Arc<SessionState>, store: Arc<dyn TokenStore>, cache: QueryCache) -> Self {
        Self { state, store, cache }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Authenticate against `POST /auth/login` and install the session.
    ///
    /// Persistence failures are logged and swallowed: the in-memory session
    /// is authoritative for this process lifetime.
    pub async fn login(
        &self,
        transport: &Transport,
        username: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let request = AuthRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let body = serde_json::to_value(&request)
            .map_err(|err| AuthError::Envelope(err.to_string()))?;
        let response: AuthResponse = transport
            .post_json(Scope::Public, "auth/login", body)
            .await?;

        let identity = Identity::new(response.username, response.roles);
        self.state
            .install(response.access_token.clone(), identity.clone());

        let persisted = PersistedSession {
            token: response.access_token,
            identity,
        };
        if let Err(err) = self.store.save(&persisted).await {
            warn!(source = SOURCE, error = %err, "Failed to persist session");
        }
        info!(source = SOURCE, username = %persisted.identity.username, "Logged in");
        Ok(self.state.snapshot())
    }

    /// Drop the session. Idempotent; store failures are logged, not surfaced.
    pub async fn logout(&self) {
        let previous = self.state.clear();
        if let Err(err) = self.store.clear().await {
            warn!(source = SOURCE, error = %err, "Failed to clear persisted session");
        }
        self.cache.invalidate_all();
        if previous.is_authenticated() {
            info!(source = SOURCE, "Logged out");
        }
    }

    /// Forced transition on a 401 from an authenticated route.
    ///
    /// The atomic swap means only the caller that actually held the
    /// authenticated session does the teardown, so concurrent 401s produce
    /// one redirect signal.
    pub async fn handle_unauthorized(&self) {
        let previous = self.state.clear();
        if !previous.is_authenticated() {
            return;
        }
        counter!("cartella_session_unauthorized_total").increment(1);
        warn!(source = SOURCE, "Session rejected by backend, forcing logout");
        if let Err(err) = self.store.clear().await {
            warn!(source = SOURCE, error = %err, "Failed to clear persisted session");
        }
        self.cache.invalidate_all();
        self.state.signal_redirect();
    }

    /// Restore a persisted session once at startup.
    ///
    /// Absent or malformed state leaves the session anonymous without error;
    /// `is_loading` is true only for the duration of this call.
    pub async fn restore_on_startup(&self) -> Session {
        self.state.set_loading();
        match self.store.load().await {
            Ok(Some(persisted)) => {
                self.state.install(persisted.token, persisted.identity);
            }
            Ok(None) => {
                self.state.clear();
            }
            Err(err) => {
                warn!(source = SOURCE, error = %err, "Discarding unreadable persisted session");
                self.state.clear();
            }
        }
        self.state.snapshot()
    }
}

/// Request stage attaching `Authorization: Bearer <token>` to authenticated
/// requests when a token is present.
pub struct BearerStage {
    state: Arc<SessionState>,
}

impl BearerStage {
    pub fn new(state: Arc<SessionState>) -> Self {
        Self { state }
    }
}

impl RequestStage for BearerStage {
    fn apply(&self, scope: Scope, builder: RequestBuilder) -> RequestBuilder {
        if scope != Scope::Authenticated {
            return builder;
        }
        match self.state.bearer_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Response observer triggering the forced-logout transition on any 401
/// from an authenticated route.
pub struct UnauthorizedObserver {
    manager: Arc<SessionManager>,
}

impl UnauthorizedObserver {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ResponseObserver for UnauthorizedObserver {
    async fn observe(&self, scope: Scope, status: StatusCode) {
        if scope == Scope::Authenticated && status == StatusCode::UNAUTHORIZED {
            self.manager.handle_unauthorized().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use crate::config::{ApiSettings, CacheSettings};
    use crate::infra::storage::{FileTokenStore, MemoryTokenStore};

    use super::*;

    fn manager_with(store: Arc<dyn TokenStore>) -> SessionManager {
        SessionManager::new(
            Arc::new(SessionState::new()),
            store,
            QueryCache::new(&CacheSettings::default()),
        )
    }

    fn transport_for(server: &MockServer) -> Transport {
        let settings = ApiSettings {
            base_url: format!("{}/api/v1", server.base_url()),
            ..ApiSettings::default()
        };
        Transport::new(&settings, Vec::new(), Vec::new()).expect("transport")
    }

    fn persisted() -> PersistedSession {
        PersistedSession {
            token: "tok-abc".to_string(),
            identity: Identity::new("admin", vec!["ADMIN".to_string()]),
        }
    }

    #[tokio::test]
    async fn restore_installs_persisted_session() {
        let store = Arc::new(MemoryTokenStore::new());
        store.save(&persisted()).await.expect("seed");
        let manager = manager_with(store);

        let session = manager.restore_on_startup().await;
        assert!(session.is_authenticated());
        assert_eq!(session.token.as_deref(), Some("tok-abc"));
        assert_eq!(
            session.identity.expect("identity").username,
            "admin"
        );
    }

    #[tokio::test]
    async fn restore_with_empty_store_leaves_anonymous() {
        let manager = manager_with(Arc::new(MemoryTokenStore::new()));
        let session = manager.restore_on_startup().await;
        assert_eq!(session.phase, SessionPhase::Anonymous);
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn restore_swallows_malformed_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, b"{broken").await.expect("write");

        let manager = manager_with(Arc::new(FileTokenStore::new(path)));
        let session = manager.restore_on_startup().await;
        assert_eq!(session.phase, SessionPhase::Anonymous);
    }

    #[tokio::test]
    async fn login_installs_and_persists() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/auth/login")
                    .json_body(json!({"username": "admin", "password": "secret"}));
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {
                        "accessToken": "tok-xyz",
                        "tokenType": "Bearer",
                        "expiresIn": 3600,
                        "username": "admin",
                        "roles": ["ADMIN"]
                    }
                }));
            })
            .await;

        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(store.clone());
        let transport = transport_for(&server);

        let session = manager
            .login(&transport, "admin", "secret")
            .await
            .expect("login");
        assert!(session.is_authenticated());
        assert_eq!(session.token.as_deref(), Some("tok-xyz"));

        let saved = store.load().await.expect("load").expect("persisted");
        assert_eq!(saved.token, "tok-xyz");
        assert!(saved.identity.has_role("ADMIN"));
    }

    #[tokio::test]
    async fn rejected_login_is_bad_credentials_and_changes_nothing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/auth/login");
                then.status(401)
                    .json_body(json!({"success": false, "message": "Invalid credentials"}));
            })
            .await;

        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(store.clone());
        manager.restore_on_startup().await;

        let err = manager
            .login(&transport_for(&server), "admin", "wrong")
            .await
            .expect_err("bad credentials");
        assert!(matches!(err, AuthError::BadCredentials));

        let session = manager.state().snapshot();
        assert_eq!(session.phase, SessionPhase::Anonymous);
        assert!(store.load().await.expect("load").is_none());

        // A login 401 is not a session loss: no redirect was signalled.
        assert_eq!(*manager.state().redirects().borrow(), 0);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let store = Arc::new(MemoryTokenStore::new());
        store.save(&persisted()).await.expect("seed");
        let manager = manager_with(store.clone());
        manager.restore_on_startup().await;

        manager.logout().await;
        manager.logout().await;

        assert_eq!(manager.state().snapshot().phase, SessionPhase::Anonymous);
        assert!(store.load().await.expect("load").is_none());
        assert_eq!(*manager.state().redirects().borrow(), 0);
    }

    #[tokio::test]
    async fn forced_logout_signals_redirect_exactly_once() {
        let store = Arc::new(MemoryTokenStore::new());
        store.save(&persisted()).await.expect("seed");
        let manager = manager_with(store.clone());
        manager.restore_on_startup().await;

        let mut redirects = manager.state().redirects();
        assert_eq!(*redirects.borrow_and_update(), 0);

        // Two 401s racing in: only the first teardown wins the swap.
        manager.handle_unauthorized().await;
        manager.handle_unauthorized().await;

        assert_eq!(*redirects.borrow_and_update(), 1);
        assert_eq!(manager.state().snapshot().phase, SessionPhase::Anonymous);
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn bearer_stage_attaches_token_to_authenticated_requests_only() {
        let server = MockServer::start_async().await;
        let with_bearer = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v1/patients")
                    .header("authorization", "Bearer tok-abc");
                then.status(200)
                    .json_body(json!({"success": true, "data": []}));
            })
            .await;
        let without_bearer = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/health");
                then.status(200).json_body(json!({"status": "UP"}));
            })
            .await;

        let state = Arc::new(SessionState::new());
        state.install("tok-abc".to_string(), Identity::new("admin", Vec::new()));

        let settings = ApiSettings {
            base_url: format!("{}/api/v1", server.base_url()),
            ..ApiSettings::default()
        };
        let transport = Transport::new(
            &settings,
            vec![Arc::new(BearerStage::new(state))],
            Vec::new(),
        )
        .expect("transport");

        let _: Vec<serde_json::Value> = transport
            .get_json(Scope::Authenticated, "patients", &[])
            .await
            .expect("authenticated get");
        let _: serde_json::Value = transport
            .get_raw(Scope::Public, "health")
            .await
            .expect("public get");

        with_bearer.assert_async().await;
        without_bearer.assert_async().await;
    }
}
