pub mod error;
pub mod storage;
pub mod telemetry;

pub use error::InfraError;
pub use storage::{FileTokenStore, MemoryTokenStore, PersistedSession, StoreError, TokenStore};
