//! Resource query cache.
//!
//! Keyed, deduplicating, stale-while-revalidate cache over backend reads.
//! Reads subscribe through [`QueryCache::read`]; mutations run through
//! [`QueryCache::write`] and invalidate by [`KeyPrefix`].

mod engine;
mod keys;
mod store;

pub use engine::{MutationError, QueryCache, QueryResult, ReadOptions, Subscription};
pub use keys::{KeyPrefix, ParamValue, QueryKey};
pub use store::{ErasedData, QueryError, QuerySnapshot, QueryStatus};
