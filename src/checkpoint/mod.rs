//! Durable per-partition offset tracking.
//!
//! The checkpoint is the only record of progress. It is advanced strictly
//! after the sink has committed the corresponding batch, which is what gives
//! the pipeline at-least-once delivery: a crash between commit and advance
//! replays the batch, a crash before commit loses nothing.

pub mod state;
pub mod store;

pub use state::{CHECKPOINT_VERSION, CheckpointState};
pub use store::{CHECKPOINT_FILE, CheckpointStore, ObjectCheckpointStore};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::emit;
use crate::error::{CheckpointError, UnavailableSnafu};
use crate::metrics::events::CheckpointAdvanced;
use crate::record::{Offset, OffsetRanges, PartitionId};

/// Owns the in-memory view of committed offsets and keeps the store in sync.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    offsets: BTreeMap<PartitionId, Offset>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            offsets: BTreeMap::new(),
        }
    }

    /// Load the persisted offsets. Empty on first run.
    pub async fn load(&mut self) -> Result<BTreeMap<PartitionId, Offset>, CheckpointError> {
        match self.store.load().await? {
            Some(state) => {
                snafu::ensure!(
                    state.version <= CHECKPOINT_VERSION,
                    UnavailableSnafu {
                        message: format!(
                            "checkpoint version {} is newer than supported version {CHECKPOINT_VERSION}",
                            state.version
                        ),
                    }
                );
                info!(
                    location = self.store.location(),
                    offsets = ?state.offsets,
                    updated_at = %state.updated_at,
                    "Restored checkpoint"
                );
                self.offsets = state.offsets;
            }
            None => {
                info!(location = self.store.location(), "No checkpoint found, starting fresh");
                self.offsets.clear();
            }
        }
        Ok(self.offsets.clone())
    }

    /// Committed offset of `partition`, if any.
    pub fn get(&self, partition: PartitionId) -> Option<Offset> {
        self.offsets.get(&partition).copied()
    }

    pub fn offsets(&self) -> &BTreeMap<PartitionId, Offset> {
        &self.offsets
    }

    /// Record that `partition` is committed up to and including `offset`.
    ///
    /// Returns whether anything moved. See [`advance_batch`](Self::advance_batch).
    pub async fn advance(
        &mut self,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<bool, CheckpointError> {
        self.advance_to(std::iter::once((partition, offset))).await
    }

    /// Advance every partition to the end of its range in one durable write.
    ///
    /// Offsets at or below the current checkpoint are ignored; when nothing
    /// moves no write happens. The in-memory view changes only after the
    /// store has accepted the new state.
    pub async fn advance_batch(&mut self, ranges: &OffsetRanges) -> Result<bool, CheckpointError> {
        self.advance_to(ranges.iter().map(|(&p, range)| (p, range.last)))
            .await
    }

    async fn advance_to(
        &mut self,
        targets: impl Iterator<Item = (PartitionId, Offset)>,
    ) -> Result<bool, CheckpointError> {
        let mut next = self.offsets.clone();
        let mut moved = Vec::new();
        for (partition, offset) in targets {
            if next.get(&partition).is_none_or(|&current| offset > current) {
                next.insert(partition, offset);
                moved.push((partition, offset));
            }
        }

        if moved.is_empty() {
            debug!("Checkpoint unchanged, skipping write");
            return Ok(false);
        }

        self.store.persist(&CheckpointState::new(next.clone())).await?;
        self.offsets = next;

        for (partition, offset) in moved {
            emit!(CheckpointAdvanced { partition, offset });
        }
        Ok(true)
    }
}
