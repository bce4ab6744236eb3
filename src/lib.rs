//! flurry: stream records from a partitioned queue into an append-only table.
//!
//! Each record is validated against a fixed schema, scored by a pluggable
//! [`Scorer`](transform::Scorer), and appended to the destination table in
//! micro-batches. Per-partition offsets are checkpointed only after the batch
//! they cover is committed, giving at-least-once delivery across restarts.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flurry::{Config, run_pipeline, error::PipelineError};
//! use flurry::transform::KeywordScorer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("flurry.yaml")?;
//!     let scorer = Arc::new(KeywordScorer::new(&config.enrichment.keywords));
//!     let stats = run_pipeline(config, scorer).await?;
//!     println!("Wrote {} records", stats.records_written);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
pub mod storage;
pub mod transform;

pub use config::Config;
pub use pipeline::{DriverState, Pipeline, PipelineStats, run_pipeline};
pub use record::{Batch, EnrichedRecord, Offset, ParsedRecord, PartitionId, RawRecord};
pub use storage::{StorageProvider, StorageProviderRef};
