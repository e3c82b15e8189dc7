//! Client façade.
//!
//! Wires settings, token storage, session state, the query cache and the
//! transport pipeline into one handle. All state lives in `Arc`'d objects
//! owned here; nothing is process-global, so tests and embedders can run any
//! number of independent clients.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::cache::QueryCache;
use crate::config::{ConfigError, Settings};
use crate::infra::storage::{FileTokenStore, TokenStore};
use crate::patients::{HealthService, PatientService};
use crate::session::{
    AuthError, BearerStage, Session, SessionManager, SessionState, UnauthorizedObserver,
};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One connected client: session, cache and typed resource services.
pub struct Client {
    settings: Settings,
    cache: QueryCache,
    transport: Arc<Transport>,
    session: Arc<SessionManager>,
    patients: PatientService,
    health: HealthService,
}

impl Client {
    /// Build a client with the file-backed token store from `settings`.
    pub fn new(settings: Settings) -> Result<Self, ClientError> {
        let store: Arc<dyn TokenStore> =
            Arc::new(FileTokenStore::new(settings.storage.session_file.clone()));
        Self::with_store(settings, store)
    }

    /// Build a client from layered configuration (file plus `CARTELLA_*`
    /// environment overrides).
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(Settings::load(None)?)
    }

    /// Build a client over an explicit token store. Tests use this with
    /// `MemoryTokenStore`.
    pub fn with_store(
        settings: Settings,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, ClientError> {
        let state = Arc::new(SessionState::new());
        let cache = QueryCache::new(&settings.cache);
        let session = Arc::new(SessionManager::new(state.clone(), store, cache.clone()));
        let transport = Arc::new(Transport::new(
            &settings.api,
            vec![Arc::new(BearerStage::new(state))],
            vec![Arc::new(UnauthorizedObserver::new(session.clone()))],
        )?);
        let patients = PatientService::new(transport.clone(), cache.clone());
        let health = HealthService::new(
            transport.clone(),
            cache.clone(),
            settings.cache.health_refetch_interval(),
        );
        Ok(Self {
            settings,
            cache,
            transport,
            session,
            patients,
            health,
        })
    }

    /// Restore the persisted session, if any. Call once at startup.
    pub async fn start(&self) -> Session {
        self.session.restore_on_startup().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        self.session.login(&self.transport, username, password).await
    }

    pub async fn logout(&self) {
        self.session.logout().await
    }

    /// Drop the session and forget all cached data, leaving the client as if
    /// freshly started.
    pub async fn reset(&self) {
        self.session.logout().await;
    }

    pub fn session(&self) -> Session {
        self.session.state().snapshot()
    }

    /// Watch stream of session snapshots, for UI re-render.
    pub fn subscribe_session(&self) -> watch::Receiver<Session> {
        self.session.state().subscribe()
    }

    /// Watch stream of forced-logout redirect signals.
    pub fn redirects(&self) -> watch::Receiver<u64> {
        self.session.state().redirects()
    }

    pub fn patients(&self) -> &PatientService {
        &self.patients
    }

    pub fn health(&self) -> &HealthService {
        &self.health
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
