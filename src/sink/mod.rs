//! Sink writer for the append-only destination table.
//!
//! A commit either makes every row of a batch visible or none of them. The
//! driver advances the checkpoint only after [`TableSink::commit`] returns.

pub mod staged;
pub mod table;

pub use staged::StagedTableSink;
pub use table::{TableReader, TableRef};

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::SinkError;
use crate::record::Batch;

/// Proof that a batch is durably visible in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    pub batch_id: Uuid,
    /// Rows appended. Zero for a batch whose records were all rejected.
    pub rows: usize,
    /// Committed object, `None` when nothing was written.
    pub location: Option<String>,
    pub duration: Duration,
}

/// An append-only table the pipeline commits batches to.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Discard leftovers of attempts that never finished.
    ///
    /// Called once at startup before anything is committed. Returns the
    /// number of stale objects removed.
    async fn recover(&mut self) -> Result<usize, SinkError>;

    /// Append every record of `batch`, all or nothing.
    ///
    /// Committing the same batch again must not make its rows visible twice.
    async fn commit(&mut self, batch: &Batch) -> Result<CommitReceipt, SinkError>;

    /// Table identifier for logging.
    fn table_name(&self) -> &str;
}
