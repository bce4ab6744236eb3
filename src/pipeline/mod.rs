//! Pipeline driver.
//!
//! Runs the micro-batch loop `poll -> validate -> enrich -> commit ->
//! checkpoint` one batch at a time. A batch is never polled before the
//! previous one is committed and checkpointed, and the checkpoint never
//! moves before the commit succeeds.
//!
//! Poll and commit failures that look transient put the driver in
//! `Recovering` and are retried with exponential backoff for that stage only,
//! against the same undelivered batch. Anything else, and exhausted retries,
//! end in `Failed`.

pub mod retry;
mod signal;
mod state;

pub use retry::RetryPolicy;
pub use signal::{shutdown_signal, spawn_signal_handler};
pub use state::DriverState;

use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, ObjectCheckpointStore};
use crate::config::{Config, SourceKind};
use crate::dlq::{DeadLetterQueue, RejectedRecord, RejectionStage};
use crate::emit;
use crate::error::{DlqSnafu, EnrichmentSnafu, PipelineError, SinkSnafu, SourceSnafu};
use crate::metrics::events::{
    DriverStateChanged, RecordsInvalid, RecordsPolled, RetryStage, ScoringFailures, StageRetried,
};
use crate::record::{Batch, RawRecord};
use crate::sink::{CommitReceipt, StagedTableSink, TableRef, TableSink};
use crate::source::{LogDirQueue, MemoryQueue, QueueClient, SourceConnector};
use crate::storage::StorageProvider;
use crate::transform::{Enricher, SchemaValidator, Scorer};

/// Statistics about the pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub records_polled: u64,
    pub records_written: u64,
    pub records_invalid: u64,
    pub scoring_failures: u64,
    /// Records consumed but kept out of the table by the drop policy.
    pub records_dropped: u64,
    pub batches_committed: u64,
    pub poll_retries: u64,
    pub commit_retries: u64,
}

/// Outcome of transforming one polled batch.
struct Processed {
    batch: Batch,
    rejected: Vec<RejectedRecord>,
}

/// The pipeline driver.
pub struct Pipeline {
    source: SourceConnector,
    validator: SchemaValidator,
    enricher: Enricher,
    sink: Box<dyn TableSink>,
    checkpoints: CheckpointManager,
    dlq: Option<DeadLetterQueue>,
    retry: RetryPolicy,
    max_wait: Duration,
    max_records: usize,
    state: DriverState,
    stats: PipelineStats,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Assemble a driver from its components. Batch limits and retry policy
    /// start at their configured defaults.
    pub fn new(
        source: SourceConnector,
        enricher: Enricher,
        sink: Box<dyn TableSink>,
        checkpoints: CheckpointManager,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            validator: SchemaValidator::new(),
            enricher,
            sink,
            checkpoints,
            dlq: None,
            retry: RetryPolicy::default(),
            max_wait: Duration::from_secs(1),
            max_records: 500,
            state: DriverState::Starting,
            stats: PipelineStats::default(),
            shutdown,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_limits(mut self, max_wait: Duration, max_records: usize) -> Self {
        self.max_wait = max_wait;
        self.max_records = max_records.max(1);
        self
    }

    pub fn with_dlq(mut self, dlq: DeadLetterQueue) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Build a pipeline from configuration, creating the queue client the
    /// config names.
    pub async fn from_config(
        config: &Config,
        scorer: Arc<dyn Scorer>,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let client: Arc<dyn QueueClient> = match config.source.kind {
            SourceKind::LogDir => {
                let storage = StorageProvider::for_url_with_options(
                    &config.source.uri,
                    config.source.storage_options.clone(),
                )
                .await?;
                Arc::new(LogDirQueue::new(Arc::new(storage), &config.source.topic))
            }
            SourceKind::Memory => Arc::new(MemoryQueue::new(config.source.partitions)),
        };
        Self::from_config_with_client(config, client, scorer, shutdown).await
    }

    /// Build a pipeline from configuration around an existing queue client.
    pub async fn from_config_with_client(
        config: &Config,
        client: Arc<dyn QueueClient>,
        scorer: Arc<dyn Scorer>,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let table: TableRef = config.sink.table.parse()?;

        let sink_storage = StorageProvider::for_url_with_options(
            &config.sink.uri,
            config.sink.storage_options.clone(),
        )
        .await?;
        let sink = StagedTableSink::new(Arc::new(sink_storage), table, &config.sink);

        let checkpoint_storage = StorageProvider::for_url_with_options(
            &config.checkpoint.uri,
            config.checkpoint.storage_options.clone(),
        )
        .await?;
        let store = ObjectCheckpointStore::new(Arc::new(checkpoint_storage));
        let checkpoints = CheckpointManager::new(Arc::new(store));

        let source = SourceConnector::new(client, config.source.starting_offsets);
        let enricher = Enricher::new(scorer, &config.enrichment);

        let mut pipeline = Self::new(source, enricher, Box::new(sink), checkpoints, shutdown)
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_batch_limits(config.source.max_wait(), config.source.max_records);

        if let Some(dlq) = DeadLetterQueue::from_config(&config.error_handling)
            .await
            .context(DlqSnafu)?
        {
            pipeline = pipeline.with_dlq(dlq);
        }

        Ok(pipeline)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run until shutdown is requested or an unrecoverable error occurs.
    ///
    /// Returns the run statistics on a clean stop. On error the driver is in
    /// [`DriverState::Failed`] and the checkpoint reflects the last batch
    /// that was fully committed.
    pub async fn run(&mut self) -> Result<PipelineStats, PipelineError> {
        self.transition(DriverState::Starting);
        info!(table = self.sink.table_name(), "Starting pipeline");

        match self.drive().await {
            Ok(()) => {
                self.transition(DriverState::Stopped);
                info!("Pipeline stopped: {:?}", self.stats);
                Ok(self.stats.clone())
            }
            Err(e) => {
                self.transition(DriverState::Failed);
                error!(error = %e, "Pipeline failed");
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        self.start().await?;
        self.transition(DriverState::Running);

        while let Some(records) = self.poll_with_retry().await? {
            if records.is_empty() {
                continue;
            }
            self.process_batch(records).await?;
        }

        info!("Shutdown requested, no batch in flight");
        Ok(())
    }

    async fn start(&mut self) -> Result<(), PipelineError> {
        self.sink
            .recover()
            .await
            .context(SinkSnafu { attempts: 1u32 })?;

        let offsets = self.checkpoints.load().await?;

        self.source
            .seek(&offsets)
            .await
            .context(SourceSnafu { attempts: 1u32 })?;
        Ok(())
    }

    /// Poll, retrying transient failures. `None` means shutdown was requested.
    async fn poll_with_retry(&mut self) -> Result<Option<Vec<RawRecord>>, PipelineError> {
        let shutdown = self.shutdown.clone();
        let mut retry = 0;
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(None),
                result = self.source.poll(self.max_wait, self.max_records) => result,
            };

            match result {
                Ok(records) => {
                    if retry > 0 {
                        info!(attempts = retry + 1, "Poll recovered");
                        self.transition(DriverState::Running);
                    }
                    return Ok(Some(records));
                }
                Err(e) if e.is_transient() && self.retry.allows(retry + 1) => {
                    retry += 1;
                    self.transition(DriverState::Recovering);
                    self.stats.poll_retries += 1;
                    emit!(StageRetried {
                        stage: RetryStage::Poll
                    });

                    let delay = self.retry.delay(retry);
                    warn!(
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Poll failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(source) => {
                    return Err(source).context(SourceSnafu {
                        attempts: retry + 1,
                    });
                }
            }
        }
    }

    /// Validate, enrich, commit and checkpoint one polled batch.
    async fn process_batch(&mut self, records: Vec<RawRecord>) -> Result<(), PipelineError> {
        let polled = records.len() as u64;
        self.stats.records_polled += polled;
        emit!(RecordsPolled { count: polled });

        let Processed { batch, rejected } = self.transform(records)?;

        let receipt = self.commit_with_retry(&batch).await?;
        self.checkpoints.advance_batch(&batch.ranges).await?;

        self.stats.records_written += receipt.rows as u64;
        self.stats.batches_committed += 1;
        debug!(
            batch = %receipt.batch_id,
            rows = receipt.rows,
            consumed = batch.consumed(),
            ranges = %batch.range_key(),
            "Batch committed and checkpointed"
        );

        if let Some(dlq) = &self.dlq
            && let Err(e) = dlq.write(receipt.batch_id, &rejected).await
        {
            warn!(batch = %receipt.batch_id, error = %e, "Failed to write rejected records");
        }

        Ok(())
    }

    fn transform(&mut self, records: Vec<RawRecord>) -> Result<Processed, PipelineError> {
        let mut batch = Batch::new();
        let mut rejected = Vec::new();
        let mut invalid = 0u64;
        let mut scoring_failures = 0u64;

        for raw in records {
            let (partition, offset) = (raw.partition, raw.offset);
            batch.consume(partition, offset);

            let parsed = match self.validator.validate(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(partition, offset, error = %e, "Dropping invalid record");
                    invalid += 1;
                    rejected.push(RejectedRecord::new(&raw, RejectionStage::Validation, &e));
                    continue;
                }
            };

            let enrichment = self
                .enricher
                .enrich(parsed)
                .context(EnrichmentSnafu { partition, offset })?;
            if enrichment.is_scoring_failure() {
                scoring_failures += 1;
            }
            match enrichment.into_record() {
                Some(record) => batch.push(partition, offset, record),
                None => {
                    self.stats.records_dropped += 1;
                    rejected.push(RejectedRecord::new(
                        &raw,
                        RejectionStage::Scoring,
                        "scoring failed",
                    ));
                }
            }
        }

        if invalid > 0 {
            self.stats.records_invalid += invalid;
            emit!(RecordsInvalid { count: invalid });
        }
        if scoring_failures > 0 {
            self.stats.scoring_failures += scoring_failures;
            emit!(ScoringFailures {
                count: scoring_failures
            });
        }

        Ok(Processed { batch, rejected })
    }

    /// Commit, retrying transient failures. Shutdown does not interrupt a
    /// commit: the batch in flight is always finished first.
    async fn commit_with_retry(&mut self, batch: &Batch) -> Result<CommitReceipt, PipelineError> {
        let mut retry = 0;
        loop {
            match self.sink.commit(batch).await {
                Ok(receipt) => {
                    if retry > 0 {
                        info!(attempts = retry + 1, batch = %receipt.batch_id, "Commit recovered");
                        self.transition(DriverState::Running);
                    }
                    return Ok(receipt);
                }
                Err(e) if e.is_transient() && self.retry.allows(retry + 1) => {
                    retry += 1;
                    self.transition(DriverState::Recovering);
                    self.stats.commit_retries += 1;
                    emit!(StageRetried {
                        stage: RetryStage::Commit
                    });

                    let delay = self.retry.delay(retry);
                    warn!(
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        ranges = %batch.range_key(),
                        error = %e,
                        "Commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(source).context(SinkSnafu {
                        attempts: retry + 1,
                    });
                }
            }
        }
    }

    fn transition(&mut self, next: DriverState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Driver state changed");
            self.state = next;
        }
        emit!(DriverStateChanged { state: next });
    }
}

/// Run a pipeline built from `config` until SIGINT/SIGTERM.
pub async fn run_pipeline(
    config: Config,
    scorer: Arc<dyn Scorer>,
) -> Result<PipelineStats, PipelineError> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mut pipeline = Pipeline::from_config(&config, scorer, shutdown).await?;
    pipeline.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::config::EnrichmentConfig;
    use crate::sink::TableReader;
    use tempfile::TempDir;

    fn post(id: &str, selftext: &str) -> String {
        serde_json::json!({
            "id": id,
            "subreddit": "rust",
            "selftext": selftext,
            "title": "title",
            "created_utc": 1_700_000_000.0,
            "url": "https://example.com",
        })
        .to_string()
    }

    struct Harness {
        _dir: TempDir,
        queue: MemoryQueue,
        reader: TableReader,
        store: Arc<ObjectCheckpointStore>,
        pipeline: Pipeline,
        shutdown: CancellationToken,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            StorageProvider::for_url(dir.path().to_str().unwrap())
                .await
                .unwrap(),
        );
        let table: TableRef = "p.d.posts".parse().unwrap();
        let sink_config = crate::config::SinkConfig {
            uri: String::new(),
            table: table.to_string(),
            staging_prefix: "_staging".to_string(),
            commit_timeout_secs: 5,
            storage_options: Default::default(),
        };
        let sink = StagedTableSink::new(storage.clone(), table.clone(), &sink_config);
        let store = Arc::new(ObjectCheckpointStore::new(storage.clone()));

        let queue = MemoryQueue::new(1);
        let shutdown = CancellationToken::new();
        let source = SourceConnector::new(
            Arc::new(queue.clone()),
            crate::config::StartingOffsets::Earliest,
        )
        .with_recheck_interval(Duration::from_millis(5));
        let scorer: Arc<dyn Scorer> = Arc::new(|text: &str| text.len() as i32);

        let pipeline = Pipeline::new(
            source,
            Enricher::new(scorer, &EnrichmentConfig::default()),
            Box::new(sink),
            CheckpointManager::new(store.clone()),
            shutdown.clone(),
        )
        .with_retry_policy(RetryPolicy::immediate(3))
        .with_batch_limits(Duration::from_millis(20), 100);

        Harness {
            _dir: dir,
            queue,
            reader: TableReader::new(storage, table),
            store,
            pipeline,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_stops_cleanly_when_already_cancelled() {
        let mut h = harness().await;
        h.shutdown.cancel();

        let stats = h.pipeline.run().await.unwrap();
        assert_eq!(stats, PipelineStats::default());
        assert_eq!(h.pipeline.state(), DriverState::Stopped);
    }

    #[tokio::test]
    async fn test_single_batch_flows_to_table() {
        let mut h = harness().await;
        h.queue.append(0, post("a", "hello")).await.unwrap();
        h.queue.append(0, "{broken").await.unwrap();

        let shutdown = h.shutdown.clone();
        let task = tokio::spawn(async move {
            let result = h.pipeline.run().await;
            (h, result)
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        let (h, result) = task.await.unwrap();

        let stats = result.unwrap();
        assert_eq!(stats.records_written, 1);
        assert_eq!(stats.records_invalid, 1);

        let rows = h.reader.rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].relevance_score, 5);

        let state = h.store.load().await.unwrap().unwrap();
        assert_eq!(state.offsets[&0], 1);
    }
}
