//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which records the matching
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::pipeline::DriverState;
use crate::record::{Offset, PartitionId};

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Record flow
// ============================================================================

/// Raw records returned by a source poll.
pub struct RecordsPolled {
    pub count: u64,
}

impl InternalEvent for RecordsPolled {
    fn emit(self) {
        trace!(count = self.count, "Records polled");
        counter!("flurry_records_polled_total").increment(self.count);
    }
}

/// Records rejected by the schema validator.
pub struct RecordsInvalid {
    pub count: u64,
}

impl InternalEvent for RecordsInvalid {
    fn emit(self) {
        trace!(count = self.count, "Records invalid");
        counter!("flurry_records_invalid_total").increment(self.count);
    }
}

/// Records whose scorer call failed.
pub struct ScoringFailures {
    pub count: u64,
}

impl InternalEvent for ScoringFailures {
    fn emit(self) {
        trace!(count = self.count, "Scoring failures");
        counter!("flurry_scoring_failures_total").increment(self.count);
    }
}

/// Rows appended to the destination table.
pub struct RecordsWritten {
    pub count: u64,
}

impl InternalEvent for RecordsWritten {
    fn emit(self) {
        trace!(count = self.count, "Records written");
        counter!("flurry_records_written_total").increment(self.count);
    }
}

/// Rejected records written to the dead letter location.
pub struct DlqRecordsWritten {
    pub count: u64,
}

impl InternalEvent for DlqRecordsWritten {
    fn emit(self) {
        trace!(count = self.count, "DLQ records written");
        counter!("flurry_dlq_records_total").increment(self.count);
    }
}

/// A batch was durably committed to the destination table.
pub struct BatchCommitted {
    pub duration: Duration,
}

impl InternalEvent for BatchCommitted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Batch committed"
        );
        counter!("flurry_batches_committed_total").increment(1);
        histogram!("flurry_commit_duration_seconds").record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Driver & recovery
// ============================================================================

/// Pipeline stage that can be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStage {
    Poll,
    Commit,
}

impl RetryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStage::Poll => "poll",
            RetryStage::Commit => "commit",
        }
    }
}

/// A stage failed transiently and will be retried.
pub struct StageRetried {
    pub stage: RetryStage,
}

impl InternalEvent for StageRetried {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Stage retried");
        counter!("flurry_stage_retries_total", "stage" => self.stage.as_str()).increment(1);
    }
}

/// The driver moved to a new state.
pub struct DriverStateChanged {
    pub state: DriverState,
}

impl InternalEvent for DriverStateChanged {
    fn emit(self) {
        trace!(state = %self.state, "Driver state changed");
        gauge!("flurry_driver_state").set(self.state.code() as f64);
    }
}

/// The durable offset of a partition moved forward.
pub struct CheckpointAdvanced {
    pub partition: PartitionId,
    pub offset: Offset,
}

impl InternalEvent for CheckpointAdvanced {
    fn emit(self) {
        trace!(
            partition = self.partition,
            offset = self.offset,
            "Checkpoint advanced"
        );
        gauge!("flurry_checkpoint_offset", "partition" => self.partition.to_string())
            .set(self.offset as f64);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Head,
    Put,
    List,
    Rename,
    Delete,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Head => "head",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
            StorageOperation::Rename => "rename",
            StorageOperation::Delete => "delete",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// A storage request completed.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "flurry_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "flurry_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
