//! Durable client-local session storage.
//!
//! Token and identity live in one JSON document written atomically, so a
//! crash can never leave a token without its identity (or the reverse).

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use cartella_api_types::Identity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "infra::storage";

/// Session state persisted across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub token: String,
    pub identity: Identity,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed persisted session: {0}")]
    Malformed(String),
}

/// Durable key-value slot holding the persisted session.
///
/// Read once at startup, written on login, removed on logout.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedSession>, StoreError>;
    async fn save(&self, session: &PersistedSession) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

/// File-backed store: one JSON document, replaced via temp-file rename.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<PersistedSession>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let session = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        Ok(Some(session))
    }

    async fn save(&self, session: &PersistedSession) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(session)
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store for tests and embedders that opt out of persistence.
#[derive(Default)]
pub struct MemoryTokenStore {
    slot: RwLock<Option<PersistedSession>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<PersistedSession>, StoreError> {
        Ok(rw_read(&self.slot, SOURCE, "memory_load").clone())
    }

    async fn save(&self, session: &PersistedSession) -> Result<(), StoreError> {
        *rw_write(&self.slot, SOURCE, "memory_save") = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *rw_write(&self.slot, SOURCE, "memory_clear") = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedSession {
        PersistedSession {
            token: "tok-123".to_string(),
            identity: Identity::new("admin", vec!["ADMIN".to_string()]),
        }
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileTokenStore::new(dir.path().join("session.json"));

        assert!(store.load().await.expect("empty load").is_none());

        store.save(&sample()).await.expect("save");
        let loaded = store.load().await.expect("load").expect("present");
        assert_eq!(loaded, sample());

        store.clear().await.expect("clear");
        assert!(store.load().await.expect("cleared load").is_none());
    }

    #[tokio::test]
    async fn file_store_clear_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileTokenStore::new(dir.path().join("session.json"));
        store.clear().await.expect("clear missing file");
        store.clear().await.expect("clear again");
    }

    #[tokio::test]
    async fn file_store_reports_malformed_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, b"{not json").await.expect("write");

        let store = FileTokenStore::new(path);
        let err = store.load().await.expect_err("malformed");
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[tokio::test]
    async fn file_store_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileTokenStore::new(dir.path().join("nested/state/session.json"));
        store.save(&sample()).await.expect("save into nested dir");
        assert!(store.load().await.expect("load").is_some());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryTokenStore::new();
        assert!(store.load().await.expect("empty").is_none());
        store.save(&sample()).await.expect("save");
        assert_eq!(store.load().await.expect("load"), Some(sample()));
        store.clear().await.expect("clear");
        assert!(store.load().await.expect("cleared").is_none());
    }
}
