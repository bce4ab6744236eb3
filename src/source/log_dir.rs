//! Topic stored as newline-delimited objects in object storage.
//!
//! Layout: `{root}/{topic}/partition-{n}.ndjson`, one record per line. The
//! offset of a record is its zero-based line index, so producers may only
//! ever append lines.

use async_trait::async_trait;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::QueueClient;
use crate::error::{FetchSnafu, SourceError};
use crate::record::{Offset, PartitionId, RawRecord};
use crate::storage::StorageProviderRef;

const PARTITION_PREFIX: &str = "partition-";
const PARTITION_SUFFIX: &str = ".ndjson";

/// Byte positions of the lines seen so far in one partition log.
///
/// Only bytes past `scanned` are read on refresh. An unterminated tail is the
/// last record until a newline completes it, and is rescanned each time.
#[derive(Debug, Default)]
struct LineIndex {
    /// Position of the `\n` ending each complete line.
    newlines: Vec<u64>,
    /// Start of the first byte not yet covered by a complete line.
    scanned: u64,
    /// Object size at the last refresh.
    size: u64,
}

impl LineIndex {
    fn len(&self) -> usize {
        self.newlines.len() + usize::from(self.size > self.scanned)
    }

    /// Byte range of line `i`, without its newline.
    fn line(&self, i: usize) -> (u64, u64) {
        let start = match i {
            0 => 0,
            _ => self.newlines[i - 1] + 1,
        };
        let end = self.newlines.get(i).copied().unwrap_or(self.size);
        (start, end)
    }

    /// Record the newlines of `bytes`, read from `scanned` up to `size`.
    fn extend(&mut self, bytes: &[u8], size: u64) {
        let base = self.scanned;
        for (i, byte) in bytes.iter().enumerate() {
            if *byte == b'\n' {
                let at = base + i as u64;
                self.newlines.push(at);
                self.scanned = at + 1;
            }
        }
        self.size = size;
    }
}

pub struct LogDirQueue {
    storage: StorageProviderRef,
    topic: String,
    indexes: Mutex<HashMap<PartitionId, Arc<Mutex<LineIndex>>>>,
}

impl LogDirQueue {
    pub fn new(storage: StorageProviderRef, topic: impl Into<String>) -> Self {
        Self {
            storage,
            topic: topic.into(),
            indexes: Mutex::new(HashMap::new()),
        }
    }

    /// Object path of a partition log, relative to the storage root.
    pub fn partition_path(&self, partition: PartitionId) -> Path {
        Path::from(format!(
            "{}/{PARTITION_PREFIX}{partition}{PARTITION_SUFFIX}",
            self.topic
        ))
    }

    async fn index(&self, partition: PartitionId) -> Arc<Mutex<LineIndex>> {
        self.indexes
            .lock()
            .await
            .entry(partition)
            .or_default()
            .clone()
    }

    /// Bring the index up to date with the object, reading only bytes
    /// appended since the last refresh. A missing object is an empty
    /// partition.
    async fn refresh(
        &self,
        partition: PartitionId,
        index: &mut LineIndex,
    ) -> Result<(), SourceError> {
        let path = self.partition_path(partition);
        let size = match self.storage.size(path.clone()).await {
            Ok(size) => size,
            Err(e) if e.is_not_found() => 0,
            Err(source) => return Err(source).context(FetchSnafu { partition }),
        };

        if size < index.size {
            debug!(
                partition,
                size,
                previous = index.size,
                "Partition log shrank, rescanning"
            );
            *index = LineIndex::default();
        }
        if size > index.scanned && size != index.size {
            let appended = self
                .storage
                .get_range(path, index.scanned..size)
                .await
                .context(FetchSnafu { partition })?;
            index.extend(&appended, size);
        }
        Ok(())
    }
}

fn parse_partition(file_name: &str) -> Option<PartitionId> {
    file_name
        .strip_prefix(PARTITION_PREFIX)?
        .strip_suffix(PARTITION_SUFFIX)?
        .parse()
        .ok()
}

#[async_trait]
impl QueueClient for LogDirQueue {
    async fn partitions(&self) -> Result<Vec<PartitionId>, SourceError> {
        let paths = self
            .storage
            .list_with_prefix(&self.topic)
            .await
            .map_err(|e| SourceError::Connection {
                message: format!("listing topic '{}': {e}", self.topic),
            })?;

        let mut partitions: Vec<PartitionId> = paths
            .iter()
            .filter_map(|path| path.filename().and_then(parse_partition))
            .collect();
        partitions.sort_unstable();
        partitions.dedup();
        debug!(topic = %self.topic, ?partitions, "Discovered partitions");
        Ok(partitions)
    }

    async fn earliest_offset(&self, _partition: PartitionId) -> Result<Offset, SourceError> {
        Ok(0)
    }

    async fn latest_offset(&self, partition: PartitionId) -> Result<Offset, SourceError> {
        let index = self.index(partition).await;
        let mut index = index.lock().await;
        self.refresh(partition, &mut index).await?;
        Ok(index.len() as Offset)
    }

    async fn fetch(
        &self,
        partition: PartitionId,
        from: Offset,
        max_records: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let index = self.index(partition).await;
        let mut index = index.lock().await;
        self.refresh(partition, &mut index).await?;

        let first = from.max(0) as usize;
        let last = index.len().min(first.saturating_add(max_records));
        if first >= last {
            return Ok(Vec::new());
        }

        let (start, _) = index.line(first);
        let (_, end) = index.line(last - 1);
        let bytes = self
            .storage
            .get_range(self.partition_path(partition), start..end)
            .await
            .context(FetchSnafu { partition })?;

        Ok((first..last)
            .map(|offset| {
                let (line_start, line_end) = index.line(offset);
                let payload =
                    bytes.slice((line_start - start) as usize..(line_end - start) as usize);
                RawRecord::new(partition, offset as Offset, payload)
            })
            .collect())
    }
}
