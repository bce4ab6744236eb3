//! Dead letter output for records that never reach the table.
//!
//! Records rejected by validation, or dropped because scoring failed, are
//! written as NDJSON to a configurable location for later inspection. One
//! object is written per committed batch and named after the batch, so a
//! replayed batch overwrites its own rejects.

use chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ErrorHandlingConfig;
use crate::emit;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::metrics::events::DlqRecordsWritten;
use crate::record::{Offset, PartitionId, RawRecord};
use crate::storage::{StorageProvider, StorageProviderRef};

/// Why a record was kept out of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionStage {
    Validation,
    Scoring,
}

/// A record that was consumed but not written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub stage: RejectionStage,
    pub error: String,
    /// Payload as text; invalid UTF-8 is replaced.
    pub payload: String,
    pub rejected_at: DateTime<Utc>,
}

impl RejectedRecord {
    pub fn new(raw: &RawRecord, stage: RejectionStage, error: impl ToString) -> Self {
        Self {
            partition: raw.partition,
            offset: raw.offset,
            stage,
            error: error.to_string(),
            payload: String::from_utf8_lossy(&raw.payload).into_owned(),
            rejected_at: Utc::now(),
        }
    }
}

pub struct DeadLetterQueue {
    storage: StorageProviderRef,
}

impl DeadLetterQueue {
    /// Create a DLQ from configuration.
    ///
    /// Returns `None` if no DLQ path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        info!("DLQ enabled: {}", storage.url());
        Ok(Some(Self::new(Arc::new(storage))))
    }

    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    fn path_for(batch_id: Uuid) -> Path {
        Path::from(format!("rejected/{batch_id}.ndjson"))
    }

    /// Write the rejects of one batch. Nothing is written for an empty slice.
    pub async fn write(&self, batch_id: Uuid, records: &[RejectedRecord]) -> Result<(), DlqError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut ndjson = String::new();
        for record in records {
            ndjson.push_str(&serde_json::to_string(record).context(DlqSerializeSnafu)?);
            ndjson.push('\n');
        }

        self.storage
            .put(Self::path_for(batch_id), ndjson)
            .await
            .context(DlqWriteSnafu)?;

        emit!(DlqRecordsWritten {
            count: records.len() as u64
        });
        debug!(batch = %batch_id, count = records.len(), "Wrote rejected records to DLQ");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_dlq_disabled_without_path() {
        let dlq = DeadLetterQueue::from_config(&ErrorHandlingConfig::default())
            .await
            .unwrap();
        assert!(dlq.is_none());
    }

    #[tokio::test]
    async fn test_dlq_writes_one_object_per_batch() {
        let temp_dir = TempDir::new().unwrap();
        let config = ErrorHandlingConfig {
            dlq_path: Some(temp_dir.path().to_str().unwrap().to_string()),
            ..Default::default()
        };
        let dlq = DeadLetterQueue::from_config(&config).await.unwrap().unwrap();

        let raw = RawRecord::new(2, 17, vec![b'{', 0xff]);
        let rejected = RejectedRecord::new(&raw, RejectionStage::Validation, "not valid UTF-8");
        let batch_id = Uuid::new_v4();

        dlq.write(batch_id, &[rejected.clone()]).await.unwrap();
        dlq.write(batch_id, &[rejected]).await.unwrap();
        dlq.write(Uuid::new_v4(), &[]).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(temp_dir.path().join("rejected"))
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1);

        let content = std::fs::read_to_string(
            temp_dir
                .path()
                .join("rejected")
                .join(format!("{batch_id}.ndjson")),
        )
        .unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["partition"], 2);
        assert_eq!(line["offset"], 17);
        assert_eq!(line["stage"], "validation");
        assert_eq!(line["payload"], "{\u{fffd}");
    }
}
