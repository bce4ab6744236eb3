//! Consumer positions and batched polling over a [`QueueClient`].

use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::QueueClient;
use crate::config::StartingOffsets;
use crate::error::SourceError;
use crate::record::{Offset, PartitionId, RawRecord};

/// How often an idle poll re-checks the queue before `max_wait` runs out.
const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Reads micro-batches from every partition of a topic.
///
/// Positions are the next offset to read per partition. They only move when
/// a [`poll`](Self::poll) call returns, so dropping a poll future never
/// loses records.
pub struct SourceConnector {
    client: Arc<dyn QueueClient>,
    starting_offsets: StartingOffsets,
    positions: BTreeMap<PartitionId, Offset>,
    recheck_interval: Duration,
    rotation: usize,
}

impl SourceConnector {
    pub fn new(client: Arc<dyn QueueClient>, starting_offsets: StartingOffsets) -> Self {
        Self {
            client,
            starting_offsets,
            positions: BTreeMap::new(),
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
            rotation: 0,
        }
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    /// Next offset to read for each known partition.
    pub fn positions(&self) -> &BTreeMap<PartitionId, Offset> {
        &self.positions
    }

    /// Resolve the starting position of every partition.
    ///
    /// A checkpointed partition resumes right after its checkpoint. Other
    /// partitions start at the configured earliest or latest offset.
    pub async fn seek(
        &mut self,
        checkpoints: &BTreeMap<PartitionId, Offset>,
    ) -> Result<(), SourceError> {
        self.positions.clear();
        for partition in self.client.partitions().await? {
            let position = match checkpoints.get(&partition) {
                Some(&offset) => {
                    let earliest = self.client.earliest_offset(partition).await?;
                    if offset + 1 < earliest {
                        warn!(
                            partition,
                            checkpoint = offset,
                            earliest,
                            "Checkpoint is older than retained data, skipping ahead"
                        );
                    }
                    (offset + 1).max(earliest)
                }
                None => self.default_position(partition, self.starting_offsets).await?,
            };
            info!(partition, position, "Partition positioned");
            self.positions.insert(partition, position);
        }
        Ok(())
    }

    async fn default_position(
        &self,
        partition: PartitionId,
        starting_offsets: StartingOffsets,
    ) -> Result<Offset, SourceError> {
        match starting_offsets {
            StartingOffsets::Earliest => self.client.earliest_offset(partition).await,
            StartingOffsets::Latest => self.client.latest_offset(partition).await,
        }
    }

    /// Pick up partitions created after `seek`. They start at their earliest
    /// offset, since anything in them was written after we started.
    async fn discover_partitions(&mut self) -> Result<(), SourceError> {
        for partition in self.client.partitions().await? {
            if !self.positions.contains_key(&partition) {
                let position = self
                    .default_position(partition, StartingOffsets::Earliest)
                    .await?;
                info!(partition, position, "New partition discovered");
                self.positions.insert(partition, position);
            }
        }
        Ok(())
    }

    /// Fetch up to `max_records` records across all partitions.
    ///
    /// Returns as soon as any partition yields records. When nothing arrives
    /// within `max_wait` an empty `Vec` is returned.
    pub async fn poll(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let deadline = Instant::now() + max_wait;
        loop {
            self.discover_partitions().await?;
            let rotation = self.rotation;
            // Rotate on every round, empty or not, so the remainder of a
            // share split visits every partition in turn.
            self.rotation = self.rotation.wrapping_add(1);
            let (records, next_positions) = self.fetch_round(max_records, rotation).await?;

            if !records.is_empty() {
                self.positions.extend(next_positions);
                debug!(count = records.len(), "Poll returned records");
                return Ok(records);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.recheck_interval.min(deadline - now)).await;
        }
    }

    /// Fetch until `max_records` is reached or every partition is drained.
    ///
    /// The first pass splits `max_records` fairly. Budget left over by short
    /// partitions is offered again to partitions that got no share or filled
    /// theirs. Does not touch `self.positions`.
    async fn fetch_round(
        &self,
        max_records: usize,
        rotation: usize,
    ) -> Result<(Vec<RawRecord>, BTreeMap<PartitionId, Offset>), SourceError> {
        let mut cursor = self.positions.clone();
        let mut candidates: Vec<PartitionId> = cursor.keys().copied().collect();
        let mut records = Vec::new();

        while records.len() < max_records && !candidates.is_empty() {
            let shares = fair_shares(&candidates, max_records - records.len(), rotation);

            let fetches = shares.iter().map(|&(partition, share)| {
                let position = cursor[&partition];
                let client = Arc::clone(&self.client);
                async move {
                    let fetched = client.fetch(partition, position, share).await?;
                    Ok::<_, SourceError>((partition, position, share, fetched))
                }
            });

            let mut more = Vec::new();
            for (partition, position, share, fetched) in try_join_all(fetches).await? {
                let mut next = position;
                let mut taken = 0;
                for record in fetched.into_iter().take(share) {
                    // Never hand out an offset twice or go backwards.
                    if record.offset < next {
                        continue;
                    }
                    next = record.offset + 1;
                    taken += 1;
                    records.push(record);
                }
                cursor.insert(partition, next);
                if taken == share {
                    more.push(partition);
                }
            }

            // Partitions left out of this pass still get a turn.
            more.extend(
                candidates
                    .iter()
                    .copied()
                    .filter(|p| !shares.iter().any(|(shared, _)| shared == p)),
            );
            more.sort_unstable();
            candidates = more;
        }

        cursor.retain(|partition, next| self.positions.get(partition) != Some(next));
        Ok((records, cursor))
    }
}

/// Split `max_records` across partitions. The remainder goes to the
/// partitions after `rotation`, so no partition is favoured over time.
fn fair_shares(
    partitions: &[PartitionId],
    max_records: usize,
    rotation: usize,
) -> Vec<(PartitionId, usize)> {
    let count = partitions.len();
    if count == 0 {
        return Vec::new();
    }
    let base = max_records / count;
    let remainder = max_records % count;
    partitions
        .iter()
        .enumerate()
        .map(|(i, &partition)| {
            let bonus = usize::from((i + count - rotation % count) % count < remainder);
            (partition, base + bonus)
        })
        .filter(|(_, share)| *share > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{LogDirQueue, MemoryQueue};
    use crate::storage::StorageProvider;

    fn connector(queue: &MemoryQueue, starting: StartingOffsets) -> SourceConnector {
        SourceConnector::new(Arc::new(queue.clone()), starting)
            .with_recheck_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_fair_shares() {
        assert_eq!(fair_shares(&[0, 1, 2], 9, 0), vec![(0, 3), (1, 3), (2, 3)]);
        assert_eq!(fair_shares(&[0, 1, 2], 10, 0), vec![(0, 4), (1, 3), (2, 3)]);
        assert_eq!(fair_shares(&[0, 1, 2], 10, 1), vec![(0, 3), (1, 4), (2, 3)]);
        assert_eq!(fair_shares(&[0, 1, 2], 1, 2), vec![(2, 1)]);
        assert!(fair_shares(&[], 10, 0).is_empty());
    }

    #[tokio::test]
    async fn test_seek_resumes_after_checkpoint() {
        let queue = MemoryQueue::new(2);
        queue.extend(0, (0..150).map(|i| i.to_string())).await.unwrap();
        queue.extend(1, ["a", "b"]).await.unwrap();

        let mut source = connector(&queue, StartingOffsets::Latest);
        source.seek(&BTreeMap::from([(0, 99)])).await.unwrap();

        assert_eq!(source.positions()[&0], 100);
        assert_eq!(source.positions()[&1], 2);

        let records = source.poll(Duration::ZERO, 10).await.unwrap();
        assert_eq!(records.first().map(|r| r.offset), Some(100));
    }

    #[tokio::test]
    async fn test_earliest_starts_at_zero() {
        let queue = MemoryQueue::new(1);
        queue.extend(0, ["a", "b", "c"]).await.unwrap();

        let mut source = connector(&queue, StartingOffsets::Earliest);
        source.seek(&BTreeMap::new()).await.unwrap();
        let records = source.poll(Duration::ZERO, 10).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(source.positions()[&0], 3);
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let queue = MemoryQueue::new(1);
        let mut source = connector(&queue, StartingOffsets::Latest);
        source.seek(&BTreeMap::new()).await.unwrap();

        let start = std::time::Instant::now();
        let records = source.poll(Duration::from_millis(30), 10).await.unwrap();
        assert!(records.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_poll_returns_once_records_arrive() {
        let queue = MemoryQueue::new(1);
        let mut source = connector(&queue, StartingOffsets::Latest);
        source.seek(&BTreeMap::new()).await.unwrap();

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.append(0, "late").await.unwrap();
        });

        let records = source.poll(Duration::from_secs(5), 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 0);
    }

    #[tokio::test]
    async fn test_offsets_strictly_increase_across_polls() {
        let queue = MemoryQueue::new(3);
        for p in 0..3 {
            queue.extend(p, (0..20).map(|i| i.to_string())).await.unwrap();
        }
        let mut source = connector(&queue, StartingOffsets::Earliest);
        source.seek(&BTreeMap::new()).await.unwrap();

        let mut last: BTreeMap<PartitionId, Offset> = BTreeMap::new();
        let mut total = 0;
        loop {
            let records = source.poll(Duration::ZERO, 7).await.unwrap();
            if records.is_empty() {
                break;
            }
            assert!(records.len() <= 7);
            for record in records {
                if let Some(prev) = last.insert(record.partition, record.offset) {
                    assert!(record.offset > prev);
                }
                total += 1;
            }
        }
        assert_eq!(total, 60);
    }

    #[tokio::test]
    async fn test_small_batches_reach_every_partition() {
        let queue = MemoryQueue::new(2);
        queue.extend(1, ["a", "b", "c"]).await.unwrap();
        let mut source = connector(&queue, StartingOffsets::Earliest);
        source.seek(&BTreeMap::new()).await.unwrap();

        let mut offsets = Vec::new();
        for _ in 0..5 {
            for record in source.poll(Duration::from_millis(20), 1).await.unwrap() {
                assert_eq!(record.partition, 1);
                offsets.push(record.offset);
            }
        }
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(source.positions()[&0], 0);
        assert_eq!(source.positions()[&1], 3);
    }

    #[tokio::test]
    async fn test_budget_left_by_short_partitions_is_reused() {
        let queue = MemoryQueue::new(3);
        queue.extend(0, ["a"]).await.unwrap();
        queue.extend(2, (0..10).map(|i| i.to_string())).await.unwrap();
        let mut source = connector(&queue, StartingOffsets::Earliest);
        source.seek(&BTreeMap::new()).await.unwrap();

        let records = source.poll(Duration::ZERO, 6).await.unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records.iter().filter(|r| r.partition == 0).count(), 1);
        assert_eq!(records.iter().filter(|r| r.partition == 2).count(), 5);
        assert_eq!(source.positions()[&2], 5);
    }

    #[tokio::test]
    async fn test_failed_poll_does_not_move_positions() {
        let queue = MemoryQueue::new(1);
        queue.extend(0, ["a", "b"]).await.unwrap();
        let mut source = connector(&queue, StartingOffsets::Earliest);
        source.seek(&BTreeMap::new()).await.unwrap();

        queue.fail_next_fetches(1);
        assert!(source.poll(Duration::ZERO, 10).await.is_err());
        assert_eq!(source.positions()[&0], 0);

        let records = source.poll(Duration::ZERO, 10).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_new_partitions_start_at_earliest() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            StorageProvider::for_url(dir.path().to_str().unwrap())
                .await
                .unwrap(),
        );
        let queue = LogDirQueue::new(Arc::clone(&storage), "reddit");
        let path = queue.partition_path(0);

        let mut source = SourceConnector::new(Arc::new(queue), StartingOffsets::Latest);
        source.seek(&BTreeMap::new()).await.unwrap();
        assert!(source.positions().is_empty());

        storage.put(path, b"a\nb\n".to_vec()).await.unwrap();
        let records = source.poll(Duration::ZERO, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 0);
    }
}
