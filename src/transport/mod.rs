//! Authenticated HTTP transport.
//!
//! One [`Transport`] per client: a `reqwest` client plus an explicit
//! middleware pipeline composed once at construction. Request stages run in
//! order on every outgoing request (bearer attachment lives here); response
//! observers see every response status (the forced-logout trigger lives
//! here). Callers declare whether a request is [`Scope::Authenticated`] or
//! [`Scope::Public`] so a rejected login never counts as a session loss.

use std::sync::Arc;

use async_trait::async_trait;
use cartella_api_types::ApiEnvelope;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::cache::{MutationError, QueryError};
use crate::config::ApiSettings;

/// Whether the request belongs to the authenticated session.
///
/// Observers use this to tell a 401 on `/auth/login` (bad credentials) from
/// a 401 on a resource route (expired or revoked session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Authenticated,
    Public,
}

/// Ordered request middleware: each stage may decorate the outgoing request.
pub trait RequestStage: Send + Sync {
    fn apply(&self, scope: Scope, builder: RequestBuilder) -> RequestBuilder;
}

/// Ordered response middleware: observers see the status of every response
/// before the caller does.
#[async_trait]
pub trait ResponseObserver: Send + Sync {
    async fn observe(&self, scope: Scope, status: StatusCode);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unauthorized")]
    Unauthorized,
    #[error("request rejected ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("malformed response envelope: {0}")]
    Envelope(String),
}

impl From<TransportError> for QueryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized => Self::Unauthorized,
            other => Self::Fetch(other.to_string()),
        }
    }
}

impl From<TransportError> for MutationError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized => Self::Unauthorized,
            other => Self::Failed(other.to_string()),
        }
    }
}

/// HTTP transport with the middleware pipeline baked in.
pub struct Transport {
    client: Client,
    base: Url,
    request_stages: Vec<Arc<dyn RequestStage>>,
    response_observers: Vec<Arc<dyn ResponseObserver>>,
}

impl Transport {
    pub fn new(
        settings: &ApiSettings,
        request_stages: Vec<Arc<dyn RequestStage>>,
        response_observers: Vec<Arc<dyn ResponseObserver>>,
    ) -> Result<Self, TransportError> {
        let mut base = Url::parse(&settings.base_url)?;
        // Joining relative paths drops the last segment unless the base ends
        // with a slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base,
            request_stages,
            response_observers,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("cartella/", env!("CARGO_PKG_VERSION"))
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, TransportError> {
        let mut url = self.base.join(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        scope: Scope,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<Response, TransportError> {
        let url = self.url(path, query)?;
        let mut request = self.client.request(method.clone(), url);
        for stage in &self.request_stages {
            request = stage.apply(scope, request);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(%method, path, %status, "Request completed");
        for observer in &self.response_observers {
            observer.observe(scope, status).await;
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        Ok(response)
    }

    /// Parse the standard response envelope, surfacing backend rejections.
    async fn read_envelope<T: DeserializeOwned>(
        response: Response,
    ) -> Result<ApiEnvelope<T>, TransportError> {
        let status = response.status();
        let bytes = response.bytes().await?;
        let envelope: ApiEnvelope<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(TransportError::Rejected {
                    status,
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            Err(err) => return Err(TransportError::Envelope(err.to_string())),
        };
        if !status.is_success() || !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "request failed".to_string());
            return Err(TransportError::Rejected { status, message });
        }
        Ok(envelope)
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        response: Response,
    ) -> Result<T, TransportError> {
        Self::read_envelope(response)
            .await?
            .data
            .ok_or_else(|| TransportError::Envelope("missing data field".to_string()))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        scope: Scope,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TransportError> {
        let response = self.send(scope, Method::GET, path, query, None).await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        scope: Scope,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let response = self
            .send(scope, Method::POST, path, &[], Some(body))
            .await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn put_json<T: DeserializeOwned>(
        &self,
        scope: Scope,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let response = self.send(scope, Method::PUT, path, &[], Some(body)).await?;
        Self::unwrap_envelope(response).await
    }

    /// Issue a DELETE. Accepts both a bare 204 and an enveloped success body
    /// (whose `data` is null).
    pub async fn delete(&self, scope: Scope, path: &str) -> Result<(), TransportError> {
        let response = self.send(scope, Method::DELETE, path, &[], None).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        Self::read_envelope::<serde_json::Value>(response)
            .await
            .map(|_| ())
    }

    /// Fetch an un-enveloped payload. The health probes answer bare JSON and
    /// keep doing so on 503, so the body is parsed regardless of status.
    pub async fn get_raw<T: DeserializeOwned>(
        &self,
        scope: Scope,
        path: &str,
    ) -> Result<T, TransportError> {
        let response = self.send(scope, Method::GET, path, &[], None).await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| {
            if status.is_success() {
                TransportError::Envelope(err.to_string())
            } else {
                TransportError::Rejected {
                    status,
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                }
            }
        })
    }
}
