//! Query cache storage.
//!
//! One map of [`QueryKey`] → entry. Each entry carries the latest snapshot on
//! a `watch` channel (every subscriber of a key observes the same status
//! transitions), a type-erased fetcher for background refetches, and a
//! monotonic generation used to discard superseded fetch completions.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::util::lock::{rw_read, rw_write};

use super::keys::{KeyPrefix, QueryKey};

const SOURCE: &str = "cache::store";

/// Cached payload, erased so entries of different resource types share one map.
pub type ErasedData = Arc<dyn Any + Send + Sync>;
pub(crate) type ErasedResult = Result<ErasedData, QueryError>;
pub(crate) type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, ErasedResult> + Send + Sync>;

/// Non-auth fetch failures are delivered to the key's subscribers only;
/// `Unauthorized` additionally forces the global session transition (handled
/// by the transport layer before the cache ever sees the error).
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Broadcast state of one entry. Previous data is retained through `Loading`
/// and `Error` so subscribers can keep rendering stale data while a refetch
/// runs.
#[derive(Clone)]
pub struct QuerySnapshot {
    pub status: QueryStatus,
    pub data: Option<ErasedData>,
    pub error: Option<String>,
}

impl QuerySnapshot {
    fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
        }
    }

    pub fn downcast_data<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data.clone().and_then(|data| data.downcast::<T>().ok())
    }
}

/// Work order for a dispatched fetch: apply the completion only if the
/// entry's generation still matches.
pub(crate) struct RefetchTicket {
    pub key: QueryKey,
    pub generation: u64,
    pub fetcher: ErasedFetcher,
}

/// Outcome of subscribing a reader to a key.
pub(crate) enum ReadDecision {
    /// Entry is fresh; no fetch needed.
    Fresh(watch::Receiver<QuerySnapshot>),
    /// A valid fetch is already in flight; attach to it.
    Attach(watch::Receiver<QuerySnapshot>),
    /// Caller must dispatch the fetch described by the ticket.
    Dispatch(watch::Receiver<QuerySnapshot>, RefetchTicket),
}

struct CacheEntry {
    tx: watch::Sender<QuerySnapshot>,
    fetcher: ErasedFetcher,
    fetched_at: Option<Instant>,
    stale: bool,
    /// True while a fetch whose generation matches `generation` is running.
    in_flight: bool,
    generation: u64,
    subscribers: usize,
    idle_since: Option<Instant>,
}

impl CacheEntry {
    fn new(fetcher: ErasedFetcher) -> Self {
        let (tx, _rx) = watch::channel(QuerySnapshot::idle());
        Self {
            tx,
            fetcher,
            fetched_at: None,
            stale: false,
            in_flight: false,
            generation: 0,
            subscribers: 0,
            idle_since: None,
        }
    }

    fn is_fresh(&self, stale_time: Duration, now: Instant) -> bool {
        !self.stale
            && self.tx.borrow().status == QueryStatus::Success
            && self
                .fetched_at
                .is_some_and(|at| now.duration_since(at) < stale_time)
    }

    /// Transition to `Loading`, keeping previous data visible.
    fn broadcast_loading(&self) {
        let previous = self.tx.borrow().data.clone();
        self.tx.send_replace(QuerySnapshot {
            status: QueryStatus::Loading,
            data: previous,
            error: None,
        });
    }

    /// Bump the generation and hand out a ticket for a new fetch.
    fn dispatch(&mut self, key: &QueryKey) -> RefetchTicket {
        self.generation += 1;
        self.in_flight = true;
        self.broadcast_loading();
        RefetchTicket {
            key: key.clone(),
            generation: self.generation,
            fetcher: self.fetcher.clone(),
        }
    }
}

/// Process-wide query cache storage.
pub(crate) struct QueryStore {
    entries: RwLock<HashMap<QueryKey, CacheEntry>>,
    retention: Duration,
}

impl QueryStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Subscribe a reader to `key`, deciding whether a fetch is needed.
    ///
    /// The fetcher is stored (refreshed) on every read so invalidation and
    /// interval refetches always use the most recent one.
    pub fn subscribe_for_read(
        &self,
        key: &QueryKey,
        fetcher: ErasedFetcher,
        stale_time: Duration,
    ) -> ReadDecision {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "subscribe_for_read");
        Self::sweep(&mut entries, self.retention, now);

        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(fetcher.clone()));
        entry.fetcher = fetcher;
        entry.subscribers += 1;
        entry.idle_since = None;

        if entry.in_flight {
            counter!("cartella_cache_dedup_total").increment(1);
            return ReadDecision::Attach(entry.tx.subscribe());
        }
        if entry.is_fresh(stale_time, now) {
            counter!("cartella_cache_hit_total").increment(1);
            return ReadDecision::Fresh(entry.tx.subscribe());
        }

        counter!("cartella_cache_miss_total").increment(1);
        let ticket = entry.dispatch(key);
        ReadDecision::Dispatch(entry.tx.subscribe(), ticket)
    }

    /// Start a background refetch for a subscribed entry, unless one whose
    /// result will still be applied is already running.
    pub fn begin_refetch(&self, key: &QueryKey) -> Option<RefetchTicket> {
        let mut entries = rw_write(&self.entries, SOURCE, "begin_refetch");
        let entry = entries.get_mut(key)?;
        if entry.subscribers == 0 || entry.in_flight {
            return None;
        }
        counter!("cartella_cache_refetch_total").increment(1);
        Some(entry.dispatch(key))
    }

    /// Apply a fetch completion, unless the entry was invalidated (or
    /// evicted) after the fetch was dispatched.
    pub fn apply_completion(&self, key: &QueryKey, generation: u64, result: ErasedResult) {
        let mut entries = rw_write(&self.entries, SOURCE, "apply_completion");
        let Some(entry) = entries.get_mut(key) else {
            counter!("cartella_cache_discarded_completion_total").increment(1);
            debug!(%key, generation, "Discarding completion for evicted entry");
            return;
        };
        if entry.generation != generation {
            counter!("cartella_cache_discarded_completion_total").increment(1);
            debug!(
                %key,
                completion_generation = generation,
                entry_generation = entry.generation,
                "Discarding superseded completion"
            );
            return;
        }
        entry.in_flight = false;
        if entry.subscribers == 0 {
            // Interest in this key was dropped while the fetch ran. The
            // entry stays around for the retention window, but the result
            // is not applied; the next read dispatches a fresh fetch.
            counter!("cartella_cache_discarded_completion_total").increment(1);
            debug!(%key, "Discarding completion with no remaining subscribers");
            return;
        }

        match result {
            Ok(data) => {
                entry.fetched_at = Some(Instant::now());
                entry.stale = false;
                entry.tx.send_replace(QuerySnapshot {
                    status: QueryStatus::Success,
                    data: Some(data),
                    error: None,
                });
            }
            Err(err) => {
                let previous = entry.tx.borrow().data.clone();
                entry.tx.send_replace(QuerySnapshot {
                    status: QueryStatus::Error,
                    data: previous,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    /// Mark every entry matching one of `prefixes` stale. Entries with live
    /// subscribers are re-dispatched immediately; the returned tickets must
    /// be executed by the caller.
    pub fn invalidate_matching(&self, prefixes: &[KeyPrefix]) -> Vec<RefetchTicket> {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate_matching");
        let mut tickets = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if !prefixes.iter().any(|prefix| key.starts_with(prefix)) {
                continue;
            }
            entry.stale = true;
            entry.generation += 1;
            entry.in_flight = false;
            if entry.subscribers > 0 {
                counter!("cartella_cache_refetch_total").increment(1);
                tickets.push(entry.dispatch(key));
            }
        }
        tickets
    }

    /// Reset every entry to `Idle` without refetching. Used on logout: data
    /// from the previous session is dropped, in-flight completions are
    /// superseded, and the next read of any key goes back to the network.
    pub fn mark_all_stale(&self) {
        let mut entries = rw_write(&self.entries, SOURCE, "mark_all_stale");
        for entry in entries.values_mut() {
            entry.stale = true;
            entry.generation += 1;
            entry.in_flight = false;
            entry.fetched_at = None;
            entry.tx.send_replace(QuerySnapshot::idle());
        }
    }

    pub fn unsubscribe(&self, key: &QueryKey) {
        let mut entries = rw_write(&self.entries, SOURCE, "unsubscribe");
        if let Some(entry) = entries.get_mut(key) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                entry.idle_since = Some(Instant::now());
            }
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    fn sweep(entries: &mut HashMap<QueryKey, CacheEntry>, retention: Duration, now: Instant) {
        entries.retain(|key, entry| {
            let keep = entry.subscribers > 0
                || entry
                    .idle_since
                    .is_none_or(|idle| now.duration_since(idle) < retention);
            if !keep {
                counter!("cartella_cache_evict_total").increment(1);
                debug!(%key, "Evicting idle cache entry");
            }
            keep
        });
    }
}
