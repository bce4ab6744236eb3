//! Two-phase staged append over object storage.
//!
//! 1. Rows are written as NDJSON to `{staging}/{attempt}/{batch}.ndjson`,
//!    a location unique to this attempt.
//! 2. The staged object is renamed to `{project}/{dataset}/{table}/{batch}.ndjson`.
//!
//! Only step 2 makes rows visible. The batch id is derived from the offsets
//! the batch consumed, so a retried batch replaces its own object instead of
//! adding a second copy.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use object_store::path::Path;
use snafu::prelude::*;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CommitReceipt, TableRef, TableSink};
use crate::config::SinkConfig;
use crate::emit;
use crate::error::{
    CommitTimeoutSnafu, PublishSnafu, SerializeRowSnafu, SinkError, StageWriteSnafu,
    StagingCleanupSnafu,
};
use crate::metrics::events::{BatchCommitted, RecordsWritten};
use crate::record::{Batch, EnrichedRecord};
use crate::storage::StorageProviderRef;

pub struct StagedTableSink {
    storage: StorageProviderRef,
    table: TableRef,
    table_name: String,
    staging_prefix: String,
    commit_timeout: Duration,
}

impl StagedTableSink {
    pub fn new(storage: StorageProviderRef, table: TableRef, config: &SinkConfig) -> Self {
        Self {
            storage,
            table_name: table.to_string(),
            table,
            staging_prefix: config.staging_prefix.trim_matches('/').to_string(),
            commit_timeout: config.commit_timeout(),
        }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    fn staging_path(&self, attempt: Uuid, batch_id: Uuid) -> Path {
        Path::from(format!("{}/{attempt}/{batch_id}.ndjson", self.staging_prefix))
    }

    async fn stage_and_publish(
        &self,
        staging: &Path,
        destination: &Path,
        body: Bytes,
        batch: &str,
    ) -> Result<(), SinkError> {
        self.storage
            .put(staging.clone(), body)
            .await
            .context(StageWriteSnafu { batch })?;
        self.storage
            .rename(staging, destination)
            .await
            .context(PublishSnafu {
                batch,
                table: self.table_name.as_str(),
            })
    }
}

fn encode_rows(records: &[EnrichedRecord]) -> Result<Bytes, SinkError> {
    let mut writer = BytesMut::new().writer();
    for record in records {
        serde_json::to_writer(&mut writer, record).context(SerializeRowSnafu)?;
        writer.get_mut().put_u8(b'\n');
    }
    Ok(writer.into_inner().freeze())
}

#[async_trait]
impl TableSink for StagedTableSink {
    async fn recover(&mut self) -> Result<usize, SinkError> {
        let data = Path::from(self.table.data_prefix());
        let mut stale = self
            .storage
            .list_with_prefix(&self.staging_prefix)
            .await
            .context(StagingCleanupSnafu)?;
        // Committed rows are never deleted, even under a misplaced prefix.
        stale.retain(|path| !path.prefix_matches(&data));

        for path in &stale {
            self.storage
                .delete(path)
                .await
                .context(StagingCleanupSnafu)?;
            debug!(table = %self.table_name, %path, "Discarded stale staging object");
        }
        if !stale.is_empty() {
            info!(
                table = %self.table_name,
                count = stale.len(),
                "Discarded staging objects of unfinished commits"
            );
        }
        Ok(stale.len())
    }

    async fn commit(&mut self, batch: &Batch) -> Result<CommitReceipt, SinkError> {
        let start = Instant::now();
        let batch_id = batch.id();

        if batch.records.is_empty() {
            debug!(
                table = %self.table_name,
                batch = %batch_id,
                ranges = %batch.range_key(),
                "No rows to append"
            );
            return Ok(CommitReceipt {
                batch_id,
                rows: 0,
                location: None,
                duration: start.elapsed(),
            });
        }

        let body = encode_rows(&batch.records)?;
        let batch_name = batch_id.to_string();
        let staging = self.staging_path(Uuid::new_v4(), batch_id);
        let destination = self.table.batch_path(batch_id);

        let published = tokio::time::timeout(
            self.commit_timeout,
            self.stage_and_publish(&staging, &destination, body, &batch_name),
        )
        .await
        .unwrap_or_else(|_| {
            CommitTimeoutSnafu {
                batch: batch_name.as_str(),
                secs: self.commit_timeout.as_secs(),
            }
            .fail()
        });

        if let Err(e) = published {
            if let Err(cleanup) = self.storage.delete(&staging).await {
                warn!(%staging, error = %cleanup, "Failed to remove staging object");
            }
            return Err(e);
        }

        let duration = start.elapsed();
        emit!(RecordsWritten {
            count: batch.len() as u64
        });
        emit!(BatchCommitted { duration });
        debug!(
            table = %self.table_name,
            batch = %batch_id,
            rows = batch.len(),
            ranges = %batch.range_key(),
            "Committed batch"
        );

        Ok(CommitReceipt {
            batch_id,
            rows: batch.len(),
            location: Some(destination.to_string()),
            duration,
        })
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }
}
