//! Record types flowing through the pipeline.
//!
//! A [`RawRecord`] is what the queue hands us, a [`ParsedRecord`] is a raw
//! record that matched the fixed schema, and an [`EnrichedRecord`] carries
//! the relevance score on top. A [`Batch`] groups the enriched records of one
//! micro-batch together with the offsets it consumed.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a queue partition.
pub type PartitionId = u32;

/// Position of a record within a partition.
pub type Offset = i64;

/// Namespace for deterministic batch identifiers.
const BATCH_NAMESPACE: Uuid = Uuid::from_u128(0x5f0e_2c7a_91b4_4d6e_a3c8_7b21_f04d_9e13);

/// Bytes received from one partition at one offset.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub payload: Bytes,
    pub ingested_at: DateTime<Utc>,
}

impl RawRecord {
    /// Create a raw record stamped with the current time.
    pub fn new(partition: PartitionId, offset: Offset, payload: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            payload: payload.into(),
            ingested_at: Utc::now(),
        }
    }
}

/// A record that matched the fixed six-field schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub id: String,
    pub subreddit: String,
    pub selftext: String,
    pub title: String,
    pub created_utc: f64,
    pub url: String,
}

/// A parsed record plus its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: ParsedRecord,
    pub relevance_score: i32,
    /// Set when the scorer failed and `relevance_score` holds the sentinel.
    #[serde(default)]
    pub scoring_failed: bool,
}

/// Inclusive range of offsets consumed from one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRange {
    pub first: Offset,
    pub last: Offset,
}

impl OffsetRange {
    /// Range holding a single offset.
    pub fn single(offset: Offset) -> Self {
        Self {
            first: offset,
            last: offset,
        }
    }

    /// Widen the range to include `offset`.
    pub fn include(&mut self, offset: Offset) {
        self.first = self.first.min(offset);
        self.last = self.last.max(offset);
    }

    /// Number of offsets covered.
    pub fn len(&self) -> u64 {
        (self.last - self.first + 1) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.first, self.last)
    }
}

/// Offsets consumed by a batch, per partition.
pub type OffsetRanges = BTreeMap<PartitionId, OffsetRange>;

/// Enriched records of one micro-batch and the offsets they came from.
///
/// `ranges` covers every consumed offset, including records that were
/// rejected by validation and never made it into `records`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub records: Vec<EnrichedRecord>,
    pub ranges: OffsetRanges,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `offset` of `partition` was consumed by this batch.
    pub fn consume(&mut self, partition: PartitionId, offset: Offset) {
        self.ranges
            .entry(partition)
            .and_modify(|range| range.include(offset))
            .or_insert_with(|| OffsetRange::single(offset));
    }

    /// Add an enriched record that was consumed at `partition`/`offset`.
    pub fn push(&mut self, partition: PartitionId, offset: Offset, record: EnrichedRecord) {
        self.consume(partition, offset);
        self.records.push(record);
    }

    /// Whether no offsets were consumed at all.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of rows destined for the sink.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Number of offsets consumed across partitions.
    pub fn consumed(&self) -> u64 {
        self.ranges.values().map(OffsetRange::len).sum()
    }

    /// Deterministic identifier derived from the consumed offset ranges.
    ///
    /// Re-committing the same batch yields the same id, which lets the sink
    /// overwrite instead of duplicating.
    pub fn id(&self) -> Uuid {
        Uuid::new_v5(&BATCH_NAMESPACE, self.range_key().as_bytes())
    }

    /// Human-readable summary of the ranges, e.g. `p0:0..=99,p1:5..=9`.
    pub fn range_key(&self) -> String {
        self.ranges
            .iter()
            .map(|(partition, range)| format!("p{partition}:{range}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}
