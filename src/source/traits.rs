//! Queue client abstraction.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::record::{Offset, PartitionId, RawRecord};

/// Access to a partitioned, offset-addressed message queue.
///
/// Offsets are per partition and strictly increasing. Implementations only
/// read; the position of the consumer lives in the
/// [`SourceConnector`](super::SourceConnector).
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Partitions of the configured topic.
    async fn partitions(&self) -> Result<Vec<PartitionId>, SourceError>;

    /// Oldest offset still available in `partition`.
    async fn earliest_offset(&self, partition: PartitionId) -> Result<Offset, SourceError>;

    /// Next offset to be written to `partition`.
    async fn latest_offset(&self, partition: PartitionId) -> Result<Offset, SourceError>;

    /// Read up to `max_records` records of `partition` starting at `from`.
    ///
    /// An empty `Vec` means nothing is available yet.
    async fn fetch(
        &self,
        partition: PartitionId,
        from: Offset,
        max_records: usize,
    ) -> Result<Vec<RawRecord>, SourceError>;
}
