//! Patient resource service.
//!
//! Typed reads and mutations over `/patients`, routed through the query
//! cache: list and detail reads are cached and deduplicated; create, update
//! and delete invalidate the affected keys and refetch whatever is still
//! subscribed. The health probes live here too since the dashboard polls
//! them alongside the patient list.

use std::sync::Arc;
use std::time::Duration;

use cartella_api_types::{HealthStatus, OffsetPage, Patient, PatientRequest};
use uuid::Uuid;

use crate::cache::{
    KeyPrefix, MutationError, QueryCache, QueryError, QueryKey, ReadOptions, Subscription,
};
use crate::transport::{Scope, Transport};

const PATIENTS: &str = "patients";
const PATIENT: &str = "patient";

/// Cached CRUD over the patient resource.
pub struct PatientService {
    transport: Arc<Transport>,
    cache: QueryCache,
}

impl PatientService {
    pub fn new(transport: Arc<Transport>, cache: QueryCache) -> Self {
        Self { transport, cache }
    }

    /// Subscribe to one page of the patient list.
    ///
    /// An empty `search` means an unfiltered list and is part of the key, so
    /// filtered and unfiltered pages cache independently. Paging past the
    /// last page is the caller's concern (`OffsetPage::has_next`).
    pub fn list(
        &self,
        page: u32,
        size: u32,
        search: Option<&str>,
    ) -> Subscription<OffsetPage<Patient>> {
        let search = search.unwrap_or_default().to_string();
        let key = QueryKey::new(
            PATIENTS,
            vec![page.into(), size.into(), search.clone().into()],
        );
        let transport = self.transport.clone();
        self.cache.read(
            key,
            move || {
                let transport = transport.clone();
                let search = search.clone();
                async move {
                    let mut query = vec![("page", page.to_string()), ("size", size.to_string())];
                    if !search.is_empty() {
                        query.push(("search", search));
                    }
                    transport
                        .get_json(Scope::Authenticated, "patients", &query)
                        .await
                        .map_err(QueryError::from)
                }
            },
            ReadOptions::default(),
        )
    }

    /// Subscribe to one patient record.
    pub fn get(&self, id: Uuid) -> Subscription<Patient> {
        let key = QueryKey::new(PATIENT, vec![id.into()]);
        let transport = self.transport.clone();
        self.cache.read(
            key,
            move || {
                let transport = transport.clone();
                async move {
                    transport
                        .get_json(Scope::Authenticated, &format!("patients/{id}"), &[])
                        .await
                        .map_err(QueryError::from)
                }
            },
            ReadOptions::default(),
        )
    }

    pub async fn create(&self, request: &PatientRequest) -> Result<Patient, MutationError> {
        let body =
            serde_json::to_value(request).map_err(|err| MutationError::Failed(err.to_string()))?;
        let transport = self.transport.clone();
        self.cache
            .write(
                || async move {
                    transport
                        .post_json(Scope::Authenticated, "patients", body)
                        .await
                        .map_err(MutationError::from)
                },
                &[KeyPrefix::resource(PATIENTS)],
            )
            .await
    }

    pub async fn update(&self, id: Uuid, request: &PatientRequest) -> Result<Patient, MutationError> {
        let body =
            serde_json::to_value(request).map_err(|err| MutationError::Failed(err.to_string()))?;
        let transport = self.transport.clone();
        self.cache
            .write(
                || async move {
                    transport
                        .put_json(Scope::Authenticated, &format!("patients/{id}"), body)
                        .await
                        .map_err(MutationError::from)
                },
                &[
                    KeyPrefix::resource(PATIENTS),
                    KeyPrefix::resource(PATIENT).with(id),
                ],
            )
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), MutationError> {
        let transport = self.transport.clone();
        self.cache
            .write(
                || async move {
                    transport
                        .delete(Scope::Authenticated, &format!("patients/{id}"))
                        .await
                        .map_err(MutationError::from)
                },
                &[
                    KeyPrefix::resource(PATIENTS),
                    KeyPrefix::resource(PATIENT).with(id),
                ],
            )
            .await
    }
}

/// Backend health probes, polled on an interval while subscribed.
pub struct HealthService {
    transport: Arc<Transport>,
    cache: QueryCache,
    refetch_interval: Duration,
}

impl HealthService {
    pub fn new(transport: Arc<Transport>, cache: QueryCache, refetch_interval: Duration) -> Self {
        Self {
            transport,
            cache,
            refetch_interval,
        }
    }

    /// Liveness probe. A 503 still carries a parseable body, so a DOWN
    /// backend shows up as data, not as an error.
    pub fn health(&self) -> Subscription<HealthStatus> {
        self.probe("health")
    }

    /// Readiness probe (includes the database check).
    pub fn ready(&self) -> Subscription<HealthStatus> {
        self.probe("ready")
    }

    fn probe(&self, resource: &'static str) -> Subscription<HealthStatus> {
        let transport = self.transport.clone();
        self.cache.read(
            QueryKey::bare(resource),
            move || {
                let transport = transport.clone();
                async move {
                    transport
                        .get_raw(Scope::Public, resource)
                        .await
                        .map_err(QueryError::from)
                }
            },
            ReadOptions::stale(Duration::ZERO).with_refetch_interval(self.refetch_interval),
        )
    }
}
