//! Error types for flurry using snafu.
//!
//! Each pipeline stage has its own error enum. The driver only needs to know
//! whether a failure is transient (retry the stage) or fatal (stop).

use snafu::prelude::*;

use crate::record::{Offset, PartitionId};

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A required string setting is empty.
    #[snafu(display("{field} cannot be empty"))]
    EmptyField { field: &'static str },

    /// Table path is not `project.dataset.table`.
    #[snafu(display("Invalid table path '{path}': expected project.dataset.table"))]
    InvalidTablePath { path: String },

    /// A numeric setting is out of range.
    #[snafu(display("Invalid value for {field}: {message}"))]
    InvalidValue {
        field: &'static str,
        message: String,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Source Errors ============

/// Errors raised by the queue client or the source connector.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The queue could not be reached or refused the credentials.
    #[snafu(display("Queue connection failed: {message}"))]
    Connection { message: String },

    /// The queue storage backend failed while fetching.
    #[snafu(display("Failed to fetch partition {partition}: {source}"))]
    Fetch {
        partition: PartitionId,
        source: StorageError,
    },

    /// The requested partition does not exist.
    #[snafu(display("Unknown partition {partition}"))]
    UnknownPartition { partition: PartitionId },
}

impl SourceError {
    /// Whether the driver should retry the poll.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Connection { .. } => true,
            SourceError::Fetch { source, .. } => !source.is_not_found(),
            SourceError::UnknownPartition { .. } => false,
        }
    }
}

// ============ Validation Errors ============

/// A raw record that does not match the fixed record schema.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    /// The payload is not valid UTF-8.
    #[snafu(display("Record {partition}/{offset} is not valid UTF-8"))]
    NotUtf8 {
        partition: PartitionId,
        offset: Offset,
    },

    /// The payload is not a JSON object matching the schema.
    #[snafu(display("Record {partition}/{offset} does not match schema: {source}"))]
    Schema {
        partition: PartitionId,
        offset: Offset,
        source: serde_json::Error,
    },
}

// ============ Enrichment Errors ============

/// Failure of the external scoring function.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ScoreError {
    /// The scorer reported an error.
    #[snafu(display("Scorer failed: {message}"))]
    Rejected { message: String },

    /// The scorer panicked.
    #[snafu(display("Scorer panicked: {message}"))]
    Panicked { message: String },
}

// ============ Sink Errors ============

/// Errors that can occur while committing a batch to the destination table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Writing the batch to the staging area failed.
    #[snafu(display("Failed to stage batch {batch}: {source}"))]
    StageWrite { batch: String, source: StorageError },

    /// Moving the staged batch into the table failed.
    #[snafu(display("Failed to publish batch {batch} to {table}: {source}"))]
    Publish {
        batch: String,
        table: String,
        source: StorageError,
    },

    /// Serializing rows failed.
    #[snafu(display("Failed to serialize row: {source}"))]
    SerializeRow { source: serde_json::Error },

    /// Commit did not finish within the configured timeout.
    #[snafu(display("Commit of batch {batch} timed out after {secs}s"))]
    CommitTimeout { batch: String, secs: u64 },

    /// Cleaning the staging area failed.
    #[snafu(display("Failed to clean staging area: {source}"))]
    StagingCleanup { source: StorageError },

    /// Reading committed rows failed.
    #[snafu(display("Failed to read table rows from {path}: {message}"))]
    ReadRows { path: String, message: String },
}

impl SinkError {
    /// Whether the driver may retry the same batch.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SinkError::SerializeRow { .. })
    }
}

// ============ Checkpoint Errors ============

/// Errors that can occur while loading or persisting offsets.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Reading the checkpoint object failed.
    #[snafu(display("Failed to load checkpoint: {source}"))]
    Load { source: StorageError },

    /// Writing the checkpoint object failed.
    #[snafu(display("Failed to persist checkpoint: {source}"))]
    Persist { source: StorageError },

    /// Stored checkpoint is not valid JSON.
    #[snafu(display("Checkpoint is corrupted: {source}"))]
    Corrupted { source: serde_json::Error },

    /// Serializing the checkpoint failed.
    #[snafu(display("Failed to encode checkpoint: {source}"))]
    Encode { source: serde_json::Error },

    /// The store refused the write for another reason.
    #[snafu(display("Checkpoint store unavailable: {message}"))]
    Unavailable { message: String },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur during Dead Letter Queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix avoids snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ: {source}"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize rejected record.
    #[snafu(display("Failed to serialize DLQ record: {source}"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage: {source}"))]
    DlqStorage { source: StorageError },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error while wiring components.
    #[snafu(display("Storage error: {source}"))]
    PipelineStorage { source: StorageError },

    /// Source failed beyond the retry budget, or fatally.
    #[snafu(display("Source error after {attempts} attempt(s): {source}"))]
    Source {
        attempts: u32,
        source: SourceError,
    },

    /// Sink failed beyond the retry budget, or fatally.
    #[snafu(display("Sink error after {attempts} attempt(s): {source}"))]
    Sink { attempts: u32, source: SinkError },

    /// Checkpoint durability failure.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint { source: CheckpointError },

    /// Scoring failed and the policy says stop.
    #[snafu(display("Enrichment failed for record {partition}/{offset}: {source}"))]
    Enrichment {
        partition: PartitionId,
        offset: Offset,
        source: ScoreError,
    },

    /// DLQ error.
    #[snafu(display("DLQ error: {source}"))]
    Dlq { source: DlqError },

    /// Address parsing error.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<CheckpointError> for PipelineError {
    fn from(source: CheckpointError) -> Self {
        PipelineError::Checkpoint { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::PipelineStorage { source }
    }
}
