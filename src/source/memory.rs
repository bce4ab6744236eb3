//! In-process partitioned queue.
//!
//! Used by embedding applications that produce records themselves and by
//! tests. Cloning shares the underlying log.

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::QueueClient;
use crate::error::{ConnectionSnafu, SourceError, UnknownPartitionSnafu};
use crate::record::{Offset, PartitionId, RawRecord};

#[derive(Clone)]
pub struct MemoryQueue {
    partitions: Arc<RwLock<Vec<Vec<Bytes>>>>,
    failures: Arc<AtomicU32>,
}

impl MemoryQueue {
    /// Create a queue with `partitions` empty partitions, numbered from 0.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: Arc::new(RwLock::new(vec![Vec::new(); partitions as usize])),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Append a payload and return the offset it was assigned.
    pub async fn append(
        &self,
        partition: PartitionId,
        payload: impl Into<Bytes>,
    ) -> Result<Offset, SourceError> {
        let mut partitions = self.partitions.write().await;
        let log = partitions
            .get_mut(partition as usize)
            .context(UnknownPartitionSnafu { partition })?;
        log.push(payload.into());
        Ok(log.len() as Offset - 1)
    }

    /// Append several payloads, returning the offset of the last one.
    pub async fn extend<I, B>(&self, partition: PartitionId, payloads: I) -> Result<Offset, SourceError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut partitions = self.partitions.write().await;
        let log = partitions
            .get_mut(partition as usize)
            .context(UnknownPartitionSnafu { partition })?;
        log.extend(payloads.into_iter().map(Into::into));
        Ok(log.len() as Offset - 1)
    }

    /// Make the next `count` fetches fail with a connection error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn partitions(&self) -> Result<Vec<PartitionId>, SourceError> {
        let count = self.partitions.read().await.len() as PartitionId;
        Ok((0..count).collect())
    }

    async fn earliest_offset(&self, partition: PartitionId) -> Result<Offset, SourceError> {
        ensure!(
            (partition as usize) < self.partitions.read().await.len(),
            UnknownPartitionSnafu { partition }
        );
        Ok(0)
    }

    async fn latest_offset(&self, partition: PartitionId) -> Result<Offset, SourceError> {
        let partitions = self.partitions.read().await;
        let log = partitions
            .get(partition as usize)
            .context(UnknownPartitionSnafu { partition })?;
        Ok(log.len() as Offset)
    }

    async fn fetch(
        &self,
        partition: PartitionId,
        from: Offset,
        max_records: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        if self.take_failure() {
            return ConnectionSnafu {
                message: "injected connection failure",
            }
            .fail();
        }

        let partitions = self.partitions.read().await;
        let log = partitions
            .get(partition as usize)
            .context(UnknownPartitionSnafu { partition })?;

        let start = from.max(0) as usize;
        Ok(log
            .iter()
            .enumerate()
            .skip(start)
            .take(max_records)
            .map(|(offset, payload)| RawRecord::new(partition, offset as Offset, payload.clone()))
            .collect())
    }
}
