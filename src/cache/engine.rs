//! Query cache engine.
//!
//! [`QueryCache::read`] hands out a [`Subscription`]: a live, typed view of
//! one cache entry. Concurrent reads of the same key share a single fetch;
//! mutations go through [`QueryCache::write`], which invalidates by key
//! prefix and refetches whatever is still being watched.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CacheSettings;

use super::keys::{KeyPrefix, QueryKey};
use super::store::{
    ErasedData, ErasedFetcher, QueryError, QuerySnapshot, QueryStatus, QueryStore, ReadDecision,
    RefetchTicket,
};

/// Create/update/delete failure. Surfaced to the caller only; the cache is
/// left exactly as it was (no invalidation happens for failed mutations).
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("mutation failed: {0}")]
    Failed(String),
}

/// Per-read knobs. Unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Data younger than this is served without a refetch.
    pub stale_time: Option<Duration>,
    /// Periodic background refetch while the subscription is alive.
    pub refetch_interval: Option<Duration>,
}

impl ReadOptions {
    pub fn stale(stale_time: Duration) -> Self {
        Self {
            stale_time: Some(stale_time),
            refetch_interval: None,
        }
    }

    #[must_use]
    pub fn with_refetch_interval(mut self, period: Duration) -> Self {
        self.refetch_interval = Some(period);
        self
    }
}

/// Typed view of a snapshot, as delivered to one subscriber.
#[derive(Clone)]
pub struct QueryResult<T> {
    pub status: QueryStatus,
    pub data: Option<Arc<T>>,
    pub error: Option<String>,
}

fn typed<T: Send + Sync + 'static>(snapshot: &QuerySnapshot) -> QueryResult<T> {
    QueryResult {
        status: snapshot.status,
        data: snapshot.downcast_data::<T>(),
        error: snapshot.error.clone(),
    }
}

/// Process-wide query cache.
#[derive(Clone)]
pub struct QueryCache {
    store: Arc<QueryStore>,
    default_stale_time: Duration,
}

impl QueryCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            store: Arc::new(QueryStore::new(settings.retention())),
            default_stale_time: settings.stale_time(),
        }
    }

    /// Subscribe to `key`, fetching if the entry is absent or stale.
    ///
    /// The fetch is dispatched at most once per invalidation cycle no matter
    /// how many readers subscribe while it is in flight; every subscriber
    /// observes the same `Loading → Success | Error` transitions.
    pub fn read<T, F, Fut>(&self, key: QueryKey, fetcher: F, options: ReadOptions) -> Subscription<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let erased: ErasedFetcher = Arc::new(move || {
            fetcher()
                .map(|result| result.map(|value| Arc::new(value) as ErasedData))
                .boxed()
        });

        let stale_time = options.stale_time.unwrap_or(self.default_stale_time);
        let rx = match self.store.subscribe_for_read(&key, erased, stale_time) {
            ReadDecision::Fresh(rx) | ReadDecision::Attach(rx) => rx,
            ReadDecision::Dispatch(rx, ticket) => {
                self.spawn_fetch(ticket);
                rx
            }
        };

        let interval_task = options.refetch_interval.map(|period| {
            let store = self.store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await; // the first tick fires immediately
                loop {
                    ticker.tick().await;
                    if let Some(ticket) = store.begin_refetch(&key) {
                        let result = (ticket.fetcher)().await;
                        store.apply_completion(&ticket.key, ticket.generation, result);
                    }
                }
            })
        });

        Subscription {
            key,
            rx,
            store: self.store.clone(),
            interval_task,
            _marker: PhantomData,
        }
    }

    /// Run a mutation; on success, invalidate every entry matching one of
    /// `invalidates` and refetch those with live subscribers.
    pub async fn write<T, F, Fut>(
        &self,
        mutation: F,
        invalidates: &[KeyPrefix],
    ) -> Result<T, MutationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MutationError>>,
    {
        let value = mutation().await?;
        self.invalidate_prefixes(invalidates);
        Ok(value)
    }

    /// Mark matching entries stale and refetch the subscribed ones.
    pub fn invalidate_prefixes(&self, prefixes: &[KeyPrefix]) {
        for ticket in self.store.invalidate_matching(prefixes) {
            self.spawn_fetch(ticket);
        }
    }

    /// Mark every entry stale. Called on logout so no read after a session
    /// change can be served from the previous session's cache.
    pub fn invalidate_all(&self) {
        self.store.mark_all_stale();
    }

    pub fn entry_count(&self) -> usize {
        self.store.len()
    }

    fn spawn_fetch(&self, ticket: RefetchTicket) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let result = (ticket.fetcher)().await;
            store.apply_completion(&ticket.key, ticket.generation, result);
        });
    }
}

/// Live handle on one cache entry for one subscriber.
///
/// Dropping it detaches the subscriber and cancels any interval refetch task
/// tied to this subscription.
pub struct Subscription<T> {
    key: QueryKey,
    rx: watch::Receiver<QuerySnapshot>,
    store: Arc<QueryStore>,
    interval_task: Option<JoinHandle<()>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Latest snapshot without waiting.
    pub fn current(&self) -> QueryResult<T> {
        typed(&self.rx.borrow())
    }

    /// Wait for the next broadcast. Returns `false` if the entry was evicted.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait until the entry leaves `Loading` and return the settled result.
    ///
    /// `Idle` counts as settled: it means the entry was reset (session
    /// teardown) while this subscriber was waiting.
    pub async fn settled(&mut self) -> QueryResult<T> {
        loop {
            let snapshot = self.rx.borrow_and_update().clone();
            if snapshot.status != QueryStatus::Loading {
                return typed(&snapshot);
            }
            if self.rx.changed().await.is_err() {
                let snapshot = self.rx.borrow().clone();
                return typed(&snapshot);
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(task) = self.interval_task.take() {
            task.abort();
        }
        self.store.unsubscribe(&self.key);
    }
}
