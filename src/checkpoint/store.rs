//! Checkpoint persistence backends.

use async_trait::async_trait;
use object_store::path::Path;
use snafu::prelude::*;
use tracing::debug;

use super::CheckpointState;
use crate::error::{CheckpointError, CorruptedSnafu, EncodeSnafu, LoadSnafu, PersistSnafu};
use crate::storage::StorageProviderRef;

/// Name of the checkpoint object under the configured location.
pub const CHECKPOINT_FILE: &str = "offsets.json";

/// Durable storage for the checkpoint document.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the last persisted state, `None` on first run.
    async fn load(&self) -> Result<Option<CheckpointState>, CheckpointError>;

    /// Durably replace the stored state. Returns only once the write is
    /// durable.
    async fn persist(&self, state: &CheckpointState) -> Result<(), CheckpointError>;

    /// Location of the store, for logging.
    fn location(&self) -> &str;
}

/// Keeps the checkpoint as a single JSON object in object storage.
///
/// Object puts are atomic, so a reader sees either the previous or the new
/// document, never a partial one.
pub struct ObjectCheckpointStore {
    storage: StorageProviderRef,
    path: Path,
}

impl ObjectCheckpointStore {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self {
            storage,
            path: Path::from(CHECKPOINT_FILE),
        }
    }
}

#[async_trait]
impl CheckpointStore for ObjectCheckpointStore {
    async fn load(&self) -> Result<Option<CheckpointState>, CheckpointError> {
        let bytes = match self.storage.get(self.path.clone()).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => return Err(source).context(LoadSnafu),
        };
        let state = serde_json::from_slice(&bytes).context(CorruptedSnafu)?;
        Ok(Some(state))
    }

    async fn persist(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(state).context(EncodeSnafu)?;
        self.storage
            .put(self.path.clone(), json)
            .await
            .context(PersistSnafu)?;
        debug!(offsets = ?state.offsets, "Checkpoint persisted");
        Ok(())
    }

    fn location(&self) -> &str {
        self.storage.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageProvider;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> ObjectCheckpointStore {
        let storage = StorageProvider::for_url(dir.path().to_str().unwrap())
            .await
            .unwrap();
        ObjectCheckpointStore::new(Arc::new(storage))
    }

    #[tokio::test]
    async fn test_first_run_has_no_state() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).await.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let state = CheckpointState::new(BTreeMap::from([(0, 41), (1, 9)]));
        store.persist(&state).await.unwrap();

        assert!(dir.path().join(CHECKPOINT_FILE).exists());
        assert_eq!(store.load().await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_corrupted_checkpoint() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CHECKPOINT_FILE), b"{not json").unwrap();
        let err = store(&dir).await.load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted { .. }));
    }
}
