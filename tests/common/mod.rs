//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flurry::checkpoint::{CheckpointManager, CheckpointState, CheckpointStore, ObjectCheckpointStore};
use flurry::config::{EnrichmentConfig, SinkConfig, StartingOffsets};
use flurry::error::{CheckpointError, PipelineError, SinkError};
use flurry::pipeline::RetryPolicy;
use flurry::record::{Batch, Offset, PartitionId};
use flurry::sink::{CommitReceipt, StagedTableSink, TableReader, TableRef, TableSink};
use flurry::source::{MemoryQueue, SourceConnector};
use flurry::transform::{Enricher, Scorer};
use flurry::{EnrichedRecord, Pipeline, PipelineStats, StorageProvider, StorageProviderRef};

pub const TABLE: &str = "analytics.reddit.posts";

pub fn post(id: &str, selftext: &str) -> String {
    serde_json::json!({
        "id": id,
        "subreddit": "rust",
        "selftext": selftext,
        "title": format!("post {id}"),
        "created_utc": 1_700_000_000.0,
        "url": format!("https://example.com/{id}"),
    })
    .to_string()
}

/// Scores a record by the length of its text.
pub fn length_scorer() -> Arc<dyn Scorer> {
    Arc::new(|text: &str| text.len() as i32)
}

/// Table and checkpoint storage rooted in one temporary directory, so a
/// "restarted" pipeline sees exactly what the previous one left behind.
pub struct TestEnv {
    _dir: TempDir,
    pub storage: StorageProviderRef,
    pub table: TableRef,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(dir.path().to_str().unwrap())
            .await
            .unwrap();
        Self {
            _dir: dir,
            storage: Arc::new(storage),
            table: TABLE.parse().unwrap(),
        }
    }

    pub fn sink(&self) -> StagedTableSink {
        let config = SinkConfig {
            uri: String::new(),
            table: TABLE.to_string(),
            staging_prefix: "_staging".to_string(),
            commit_timeout_secs: 5,
            storage_options: Default::default(),
        };
        StagedTableSink::new(self.storage.clone(), self.table.clone(), &config)
    }

    pub fn store(&self) -> Arc<RecordingStore> {
        Arc::new(RecordingStore::new(ObjectCheckpointStore::new(
            self.storage.clone(),
        )))
    }

    pub fn reader(&self) -> TableReader {
        TableReader::new(self.storage.clone(), self.table.clone())
    }

    pub async fn rows(&self) -> Vec<EnrichedRecord> {
        self.reader().rows().await.unwrap()
    }

    pub async fn row_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.rows().await.into_iter().map(|r| r.record.id).collect();
        ids.sort();
        ids
    }
}

pub fn pipeline(
    queue: &MemoryQueue,
    sink: Box<dyn TableSink>,
    store: Arc<dyn CheckpointStore>,
    scorer: Arc<dyn Scorer>,
    enrichment: &EnrichmentConfig,
    shutdown: CancellationToken,
) -> Pipeline {
    let source = SourceConnector::new(Arc::new(queue.clone()), StartingOffsets::Earliest)
        .with_recheck_interval(Duration::from_millis(5));
    Pipeline::new(
        source,
        Enricher::new(scorer, enrichment),
        sink,
        CheckpointManager::new(store),
        shutdown,
    )
    .with_retry_policy(RetryPolicy::immediate(3))
    .with_batch_limits(Duration::from_millis(20), 100)
}

/// The default test pipeline: staged sink, length scorer, sentinel policy.
pub fn default_pipeline(
    env: &TestEnv,
    queue: &MemoryQueue,
    store: Arc<RecordingStore>,
    shutdown: CancellationToken,
) -> Pipeline {
    pipeline(
        queue,
        Box::new(env.sink()),
        store,
        length_scorer(),
        &EnrichmentConfig::default(),
        shutdown,
    )
}

pub type RunResult = (Pipeline, Result<PipelineStats, PipelineError>);

/// A pipeline running on its own task.
pub struct Running {
    handle: JoinHandle<RunResult>,
    shutdown: CancellationToken,
}

impl Running {
    pub fn spawn(mut pipeline: Pipeline, shutdown: CancellationToken) -> Self {
        let handle = tokio::spawn(async move {
            let result = pipeline.run().await;
            (pipeline, result)
        });
        Self { handle, shutdown }
    }

    /// Request shutdown and wait for the driver to stop.
    pub async fn stop(self) -> RunResult {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the driver to end on its own.
    pub async fn join(self) -> RunResult {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("pipeline did not finish in time")
            .unwrap()
    }
}

/// Wait until the committed offset of `partition` reaches `offset`.
pub async fn wait_for_checkpoint(store: &dyn CheckpointStore, partition: PartitionId, offset: Offset) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(state) = store.load().await.unwrap()
            && state.offsets.get(&partition).is_some_and(|o| *o >= offset)
        {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "checkpoint of partition {partition} never reached {offset}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Checkpoint store that records every persisted state and can be told to
/// refuse writes.
pub struct RecordingStore {
    inner: ObjectCheckpointStore,
    persisted: Mutex<Vec<BTreeMap<PartitionId, Offset>>>,
    fail_persist: AtomicBool,
}

impl RecordingStore {
    pub fn new(inner: ObjectCheckpointStore) -> Self {
        Self {
            inner,
            persisted: Mutex::new(Vec::new()),
            fail_persist: AtomicBool::new(false),
        }
    }

    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub fn persisted(&self) -> Vec<BTreeMap<PartitionId, Offset>> {
        self.persisted.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn load(&self) -> Result<Option<CheckpointState>, CheckpointError> {
        self.inner.load().await
    }

    async fn persist(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable {
                message: "disk full".to_string(),
            });
        }
        self.inner.persist(state).await?;
        self.persisted.lock().unwrap().push(state.offsets.clone());
        Ok(())
    }

    fn location(&self) -> &str {
        self.inner.location()
    }
}

/// Sink whose commits write through and then report a failure, the way a
/// lost acknowledgement looks to the driver. Also records the committed
/// offset of partition 0 seen at each commit call.
pub struct LossyAckSink {
    inner: StagedTableSink,
    store: Arc<RecordingStore>,
    lost_acks: AtomicU32,
    pub checkpoints_seen: Arc<Mutex<Vec<Option<Offset>>>>,
}

impl LossyAckSink {
    pub fn new(inner: StagedTableSink, store: Arc<RecordingStore>, lost_acks: u32) -> Self {
        Self {
            inner,
            store,
            lost_acks: AtomicU32::new(lost_acks),
            checkpoints_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl TableSink for LossyAckSink {
    async fn recover(&mut self) -> Result<usize, SinkError> {
        self.inner.recover().await
    }

    async fn commit(&mut self, batch: &Batch) -> Result<CommitReceipt, SinkError> {
        let committed = self
            .store
            .load()
            .await
            .unwrap()
            .and_then(|state| state.offsets.get(&0).copied());
        self.checkpoints_seen.lock().unwrap().push(committed);

        let receipt = self.inner.commit(batch).await?;
        let lose = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Err(SinkError::CommitTimeout {
                batch: receipt.batch_id.to_string(),
                secs: 0,
            });
        }
        Ok(receipt)
    }

    fn table_name(&self) -> &str {
        self.inner.table_name()
    }
}

/// Sink that never manages to commit, as if the table were unreachable.
pub struct UnreachableSink {
    pub attempts: Arc<AtomicU32>,
}

impl UnreachableSink {
    pub fn new() -> Self {
        Self {
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl TableSink for UnreachableSink {
    async fn recover(&mut self) -> Result<usize, SinkError> {
        Ok(0)
    }

    async fn commit(&mut self, batch: &Batch) -> Result<CommitReceipt, SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::CommitTimeout {
            batch: batch.id().to_string(),
            secs: 5,
        })
    }

    fn table_name(&self) -> &str {
        TABLE
    }
}
