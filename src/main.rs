//! flurry: stream queue partitions into an append-only table.
//!
//! Records are validated, scored with the configured keyword scorer, and
//! appended in micro-batches. Offsets are checkpointed after every commit so
//! a restart resumes where the last committed batch ended.

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flurry::checkpoint::{CheckpointManager, ObjectCheckpointStore};
use flurry::config::{Config, SourceKind};
use flurry::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError, SinkSnafu};
use flurry::metrics;
use flurry::pipeline::run_pipeline;
use flurry::sink::{TableReader, TableRef};
use flurry::storage::StorageProvider;
use flurry::transform::KeywordScorer;

/// Checkpointed streaming ingestion with relevance scoring.
#[derive(Parser, Debug)]
#[command(name = "flurry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline until interrupted.
    Run {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Dry run - validate configuration without processing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print checkpointed offsets and the committed row count.
    Inspect {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Command::Run { config, dry_run } => run(&config, dry_run).await,
        Command::Inspect { config } => inspect(&config).await,
    }
}

fn load_config(path: &Path) -> Result<Config, PipelineError> {
    Config::from_file(path).context(ConfigSnafu)
}

async fn run(path: &Path, dry_run: bool) -> Result<(), PipelineError> {
    info!("flurry starting");
    let config = load_config(path)?;

    if dry_run {
        info!("Dry run mode - validating configuration");
        match config.source.kind {
            SourceKind::LogDir => info!(
                "Source: {}/{} ({:?})",
                config.source.uri, config.source.topic, config.source.starting_offsets
            ),
            SourceKind::Memory => info!(
                "Source: in-memory topic {} with {} partition(s)",
                config.source.topic, config.source.partitions
            ),
        }
        info!("Sink: {} at {}", config.sink.table, config.sink.uri);
        info!("Checkpoint: {}", config.checkpoint.uri);
        info!(
            "Scoring: {} keyword(s), on failure {:?}",
            config.enrichment.keywords.len(),
            config.enrichment.on_failure
        );
        if let Some(dlq) = &config.error_handling.dlq_path {
            info!("DLQ: {}", dlq);
        }
        info!("Configuration is valid");
        return Ok(());
    }

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
    }

    let scorer = Arc::new(KeywordScorer::new(&config.enrichment.keywords));
    let stats = run_pipeline(config, scorer).await?;

    info!("Pipeline completed successfully");
    info!("  Records polled: {}", stats.records_polled);
    info!("  Records written: {}", stats.records_written);
    info!("  Invalid records: {}", stats.records_invalid);
    info!("  Scoring failures: {}", stats.scoring_failures);
    info!("  Batches committed: {}", stats.batches_committed);
    info!(
        "  Retries: {} poll, {} commit",
        stats.poll_retries, stats.commit_retries
    );

    Ok(())
}

async fn inspect(path: &Path) -> Result<(), PipelineError> {
    let config = load_config(path)?;

    let checkpoint_storage = StorageProvider::for_url_with_options(
        &config.checkpoint.uri,
        config.checkpoint.storage_options.clone(),
    )
    .await?;
    let store = ObjectCheckpointStore::new(Arc::new(checkpoint_storage));
    let mut checkpoints = CheckpointManager::new(Arc::new(store));
    let offsets = checkpoints.load().await?;

    let table: TableRef = config.sink.table.parse().context(ConfigSnafu)?;
    let sink_storage = StorageProvider::for_url_with_options(
        &config.sink.uri,
        config.sink.storage_options.clone(),
    )
    .await?;
    let rows = TableReader::new(Arc::new(sink_storage), table.clone())
        .row_count()
        .await
        .context(SinkSnafu { attempts: 1u32 })?;

    println!("table: {table}");
    println!("committed rows: {rows}");
    if offsets.is_empty() {
        println!("checkpoint: none");
    } else {
        println!("checkpoint:");
        for (partition, offset) in &offsets {
            println!("  partition {partition}: {offset}");
        }
    }
    Ok(())
}
