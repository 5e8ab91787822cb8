//! couch-sync CLI
//!
//! Replicates one database into another until the source feed terminates or
//! Ctrl-C is pressed.

use anyhow::Context;
use clap::Parser;
use couch_client::CouchClient;
use couch_core::config::{ClientConfig, CouchConfig, ObservabilityConfig};
use couch_follower::{CheckpointStore, FileCheckpoint};
use couch_replicator::{ReplicationEvent, Replicator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "couch-sync")]
#[command(about = "Replicate a CouchDB-compatible database")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "COUCH_SYNC_CONFIG")]
    config: Option<String>,

    /// Source server URL
    #[arg(long, env = "COUCH_SYNC_SOURCE")]
    source: String,

    /// Source database name
    #[arg(long, env = "COUCH_SYNC_SOURCE_DB")]
    source_db: String,

    #[arg(long, env = "COUCH_SYNC_SOURCE_USER")]
    source_user: Option<String>,

    #[arg(long, env = "COUCH_SYNC_SOURCE_PASSWORD", hide_env_values = true)]
    source_password: Option<String>,

    /// Sink server URL
    #[arg(long, env = "COUCH_SYNC_SINK")]
    sink: String,

    /// Sink database name
    #[arg(long, env = "COUCH_SYNC_SINK_DB")]
    sink_db: String,

    #[arg(long, env = "COUCH_SYNC_SINK_USER")]
    sink_user: Option<String>,

    #[arg(long, env = "COUCH_SYNC_SINK_PASSWORD", hide_env_values = true)]
    sink_password: Option<String>,

    /// Create the sink database if it does not exist
    #[arg(long)]
    create_sink: bool,

    /// Changes per replication batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Batches processed concurrently
    #[arg(long)]
    concurrency: Option<usize>,

    /// File that tracks the last checkpointed source sequence
    #[arg(long, env = "COUCH_SYNC_PROGRESS_FILE")]
    progress_file: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "pretty" {
        tracing_subscriber::registry()
            .with(fmt::layer().pretty())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    }
}

/// Client settings for one side, on top of the shared `client` section
fn side_config(
    base: &ClientConfig,
    url: String,
    user: Option<String>,
    password: Option<String>,
) -> ClientConfig {
    let mut config = ClientConfig {
        url,
        ..base.clone()
    };
    if user.is_some() {
        config.username = user;
    }
    if password.is_some() {
        config.password = password;
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = CouchConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    if let Some(batch_size) = args.batch_size {
        config.replication.batch_size = batch_size;
    }
    if let Some(concurrency) = args.concurrency {
        config.replication.concurrency = concurrency;
    }

    init_tracing(&config.observability);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting couch-sync");

    let source_config = side_config(&config.client, args.source, args.source_user, args.source_password);
    let sink_config = side_config(&config.client, args.sink, args.sink_user, args.sink_password);
    config.client = source_config.clone();
    config.validate()?;
    sink_config.root_url()?;

    let source_client = CouchClient::connect(&source_config)
        .await
        .context("connecting to source")?;
    let sink_client = CouchClient::connect(&sink_config)
        .await
        .context("connecting to sink")?;

    let source = source_client.database(&args.source_db)?;
    let sink = sink_client.database(&args.sink_db)?;
    if args.create_sink && sink.create().await? {
        info!(db = sink.name(), "Created sink database");
    }

    let mut replicator = Replicator::new(source, sink, config.replication)
        .with_follower_config(config.follower)
        .with_bulk_config(config.bulk);
    if let Some(path) = args.progress_file {
        let store = FileCheckpoint::new(path);
        if let Some(seq) = store.load().await? {
            info!(seq = %seq, "Previous run reached");
        }
        replicator = replicator.with_progress_store(Arc::new(store));
    }
    let mut replication = replicator.start().await.context("starting replication")?;
    info!(replication_id = replication.id(), "Replication running");

    if let Some(mut errors) = replication.take_errors() {
        tokio::spawn(async move {
            while let Some(err) = errors.recv().await {
                error!(stage = %err.stage, doc_id = ?err.doc_id, error = %err.error, "Replication error");
            }
        });
    }
    if let Some(mut events) = replication.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ReplicationEvent::BatchCompleted {
                        batch,
                        docs_written,
                        doc_write_failures,
                        ..
                    } => debug!(batch, docs_written, doc_write_failures, "Batch completed"),
                    ReplicationEvent::CheckpointWritten { batch, seq } => {
                        info!(batch, seq = ?seq, "Checkpoint written")
                    }
                    ReplicationEvent::CheckpointStalled { batch } => {
                        warn!(batch, "Checkpoints stalled behind a failed batch")
                    }
                }
            }
        });
    }

    let cancel = replication.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    let stats = replication.finish().await?;
    info!(
        batches = stats.batches,
        docs_read = stats.docs_read,
        docs_written = stats.docs_written,
        doc_write_failures = stats.doc_write_failures,
        errors = stats.errors,
        checkpointed_seq = ?stats.checkpointed_seq,
        "Replication complete"
    );

    source_client.stop().await;
    sink_client.stop().await;
    Ok(())
}
