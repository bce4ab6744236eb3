//! Configuration loading and validation.
//!
//! The whole pipeline is described by one YAML document. It is read once at
//! startup, environment variables are interpolated, and the resulting
//! [`Config`] is handed by reference to every component constructor.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyFieldSnafu, EnvInterpolationSnafu, InvalidValueSnafu, ReadFileSnafu,
    YamlParseSnafu,
};
use crate::sink::TableRef;

pub use vars::{interpolate, interpolate_with};

/// Main configuration structure for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which queue client backs the source connector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Topic stored as one NDJSON object per partition.
    #[default]
    LogDir,
    /// In-process queue, fed by an embedding application.
    Memory,
}

/// Where to start reading a partition that has no checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartingOffsets {
    Earliest,
    #[default]
    Latest,
}

/// Source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// Root location of the queue (ignored for `memory`).
    #[serde(default)]
    pub uri: String,

    pub topic: String,

    #[serde(default)]
    pub starting_offsets: StartingOffsets,

    /// Upper bound on how long a single poll waits for records.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Upper bound on records returned by a single poll.
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Partition count for the `memory` queue.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

impl SourceConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn default_max_wait_ms() -> u64 {
    1000
}

fn default_max_records() -> usize {
    500
}

fn default_partitions() -> u32 {
    1
}

/// What to do with a record whose scorer call failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoringFailurePolicy {
    /// Write the record with the sentinel score and `scoring_failed = true`.
    #[default]
    Sentinel,
    /// Skip the record; its offset is still consumed.
    Drop,
    /// Stop the pipeline.
    Fail,
}

/// Enrichment stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Keywords counted by the built-in keyword scorer.
    #[serde(default)]
    pub keywords: Vec<String>,

    #[serde(default)]
    pub on_failure: ScoringFailurePolicy,

    #[serde(default = "default_sentinel_score")]
    pub sentinel_score: i32,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            on_failure: ScoringFailurePolicy::default(),
            sentinel_score: default_sentinel_score(),
        }
    }
}

fn default_sentinel_score() -> i32 {
    -1
}

/// Destination table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Warehouse root. Examples: "gs://bucket/warehouse", "/data/warehouse"
    pub uri: String,

    /// Fully-qualified table path: `project.dataset.table`.
    pub table: String,

    /// Prefix under the warehouse root used for in-flight batches.
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,

    #[serde(default = "default_commit_timeout_secs")]
    pub commit_timeout_secs: u64,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

impl SinkConfig {
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }
}

fn default_staging_prefix() -> String {
    "_staging".to_string()
}

fn default_commit_timeout_secs() -> u64 {
    30
}

/// Durable offset store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub uri: String,

    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Backoff settings for retrying the poll and commit stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the random delay added to each backoff.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ms() -> u64 {
    100
}

/// Dead-letter output for records that fail validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Location to write rejected records. Disabled when unset.
    #[serde(default)]
    pub dlq_path: Option<String>,
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file, interpolating environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;

        let content = if interpolate_env {
            interpolate(&content).map_err(|errors| {
                EnvInterpolationSnafu {
                    message: errors.join("\n"),
                }
                .build()
            })?
        } else {
            content
        };

        Self::from_yaml(&content)
    }

    /// Parse and validate an already-interpolated YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            !self.source.topic.is_empty(),
            EmptyFieldSnafu {
                field: "source.topic"
            }
        );
        if self.source.kind == SourceKind::LogDir {
            ensure!(
                !self.source.uri.is_empty(),
                EmptyFieldSnafu { field: "source.uri" }
            );
        }
        ensure!(
            self.source.max_records > 0,
            InvalidValueSnafu {
                field: "source.max_records",
                message: "must be greater than zero",
            }
        );
        ensure!(
            self.source.partitions > 0,
            InvalidValueSnafu {
                field: "source.partitions",
                message: "must be greater than zero",
            }
        );

        ensure!(!self.sink.uri.is_empty(), EmptyFieldSnafu { field: "sink.uri" });
        let table: TableRef = self.sink.table.parse()?;
        ensure!(
            !self.sink.staging_prefix.trim_matches('/').is_empty(),
            EmptyFieldSnafu {
                field: "sink.staging_prefix"
            }
        );
        // Startup recovery deletes everything under the staging prefix, so it
        // must not share a path with committed table objects.
        let data_prefix = table.data_prefix();
        ensure!(
            !prefixes_overlap(&self.sink.staging_prefix, &data_prefix),
            InvalidValueSnafu {
                field: "sink.staging_prefix",
                message: format!(
                    "'{}' overlaps the table data prefix '{data_prefix}'",
                    self.sink.staging_prefix
                ),
            }
        );

        ensure!(
            !self.checkpoint.uri.is_empty(),
            EmptyFieldSnafu {
                field: "checkpoint.uri"
            }
        );

        ensure!(
            self.retry.multiplier >= 1.0,
            InvalidValueSnafu {
                field: "retry.multiplier",
                message: format!("must be at least 1.0, got {}", self.retry.multiplier),
            }
        );
        ensure!(
            self.retry.initial_backoff_ms <= self.retry.max_backoff_ms,
            InvalidValueSnafu {
                field: "retry.initial_backoff_ms",
                message: format!(
                    "must not exceed retry.max_backoff_ms ({})",
                    self.retry.max_backoff_ms
                ),
            }
        );

        Ok(())
    }
}

/// Whether one path prefix contains the other, compared by segment.
fn prefixes_overlap(a: &str, b: &str) -> bool {
    fn segments(p: &str) -> Vec<&str> {
        p.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>()
    }
    let (a, b) = (segments(a), segments(b));
    a.iter().zip(&b).all(|(x, y)| x == y)
}
