//! Replication orchestrator
//!
//! A run follows the source changes feed, groups document changes into
//! batches and hands each batch to its own task once a concurrency permit is
//! free. Waiting for a permit stalls the consumer, which in turn stops
//! draining the feed.

use crate::batch::{BatchContext, ChangeBatch};
use crate::checkpoint::LogWriter;
use crate::event::{Reporter, ReplicationError, ReplicationEvent, ReplicationStage, ReplicationStats};
use couch_bulk::Uploader;
use couch_client::Database;
use couch_core::config::{BulkConfig, FollowerConfig, ReplicationConfig};
use couch_core::error::{CouchError, Result};
use couch_core::message::ChangeEvent;
use couch_core::metrics::ReplicationMetrics;
use couch_core::replication::ReplicationLog;
use couch_follower::{ChangeStream, CheckpointStore, Follower};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deterministic id of a source/sink pair
///
/// Lowercase hex SHA-256 of `"<source url>-<sink url>"`, used as the
/// `_local` document id of the replication log on both sides.
pub fn replication_id(source: &Database, sink: &Database) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.url().as_str().as_bytes());
    hasher.update(b"-");
    hasher.update(sink.url().as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Replication of one source database into one sink database
pub struct Replicator {
    source: Database,
    sink: Database,
    config: ReplicationConfig,
    follower: FollowerConfig,
    bulk: BulkConfig,
    progress: Option<Arc<dyn CheckpointStore>>,
}

impl Replicator {
    pub fn new(source: Database, sink: Database, config: ReplicationConfig) -> Self {
        Self {
            source,
            sink,
            config,
            follower: FollowerConfig::default(),
            bulk: BulkConfig::default(),
            progress: None,
        }
    }

    /// Settings of the source changes follower
    pub fn with_follower_config(mut self, config: FollowerConfig) -> Self {
        self.follower = config;
        self
    }

    /// Settings of the sink uploader; `new_edits` is always turned off
    pub fn with_bulk_config(mut self, config: BulkConfig) -> Self {
        self.bulk = config;
        self
    }

    /// Store that receives every checkpointed source sequence
    pub fn with_progress_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.progress = Some(store);
        self
    }

    pub fn id(&self) -> String {
        replication_id(&self.source, &self.sink)
    }

    async fn read_log(db: &Database, id: &str) -> Result<ReplicationLog> {
        Ok(db
            .replication_log(id)
            .await?
            .unwrap_or_else(|| ReplicationLog::empty(format!("_local/{}", id))))
    }

    /// Resolve the resume point and start the run
    ///
    /// Fails only when the logs cannot be read or the feed cannot be opened;
    /// everything after that is reported on the run's error stream.
    pub async fn start(self) -> Result<Replication> {
        if self.config.batch_size == 0 || self.config.concurrency == 0 {
            return Err(CouchError::config(
                "replication batch_size and concurrency must be at least 1",
            ));
        }

        let id = self.id();
        let source_log = Self::read_log(&self.source, &id).await?;
        let sink_log = Self::read_log(&self.sink, &id).await?;
        let since = source_log.find_common_ancestry(&sink_log);

        info!(
            replication_id = %id,
            source = self.source.name(),
            sink = self.sink.name(),
            since = ?since,
            "Starting replication"
        );

        let bulk = BulkConfig {
            new_edits: false,
            ..self.bulk
        };
        let uploader = Arc::new(Uploader::new(&self.sink, bulk)?);

        let mut follower = Follower::new(self.source.clone(), self.follower).with_since(since);
        let changes = match follower.follow().await {
            Ok(changes) => changes,
            Err(e) => {
                uploader.stop().await;
                return Err(e);
            }
        };

        let (errors_tx, errors) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let reporter = Reporter::new(
            errors_tx,
            events_tx,
            ReplicationMetrics::new(format!("couch-replicator/{}", &id[..12])),
        );

        let context = Arc::new(BatchContext {
            source: self.source.clone(),
            sink: self.sink.clone(),
            uploader,
            log: LogWriter::new(id.clone(), self.source, self.sink).with_progress(self.progress),
            reporter,
        });

        let cancel = CancellationToken::new();
        let consumer = Consumer {
            follower,
            changes,
            context,
            batch_size: self.config.batch_size,
            permits: Arc::new(Semaphore::new(self.config.concurrency)),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(consumer.run());

        Ok(Replication {
            id,
            cancel,
            errors: Some(errors),
            events: Some(events),
            task,
        })
    }
}

/// Handle of a running replication
pub struct Replication {
    id: String,
    cancel: CancellationToken,
    errors: Option<mpsc::UnboundedReceiver<ReplicationError>>,
    events: Option<mpsc::UnboundedReceiver<ReplicationEvent>>,
    task: JoinHandle<ReplicationStats>,
}

impl Replication {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Error stream; available once
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ReplicationError>> {
        self.errors.take()
    }

    /// Progress stream; available once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ReplicationEvent>> {
        self.events.take()
    }

    /// Token that stops the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop consuming the feed; pending work still drains
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to drain and return its totals
    pub async fn finish(self) -> Result<ReplicationStats> {
        self.task
            .await
            .map_err(|e| CouchError::Internal(format!("replication task failed: {}", e)))
    }
}

/// Feed consumer task
struct Consumer {
    follower: Follower,
    changes: ChangeStream,
    context: Arc<BatchContext>,
    batch_size: usize,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Consumer {
    async fn run(mut self) -> ReplicationStats {
        let mut tasks = JoinSet::new();
        let mut batch = self.new_batch(0);

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Replication cancelled");
                    break;
                }
                event = self.changes.next() => event,
            };

            match event {
                None | Some(ChangeEvent::Terminated) => {
                    info!(last_seq = ?self.follower.last_seq(), "Source feed terminated");
                    break;
                }
                Some(ChangeEvent::Heartbeat) => continue,
                Some(ChangeEvent::Error(e)) => {
                    self.context
                        .reporter
                        .error(ReplicationError::new(ReplicationStage::Feed, e));
                }
                Some(event) => {
                    if let Some(change) = event.into_change() {
                        batch.changes.push(change);
                    }
                    if batch.changes.len() >= self.batch_size {
                        let next = self.new_batch(batch.index + 1);
                        let full = std::mem::replace(&mut batch, next);
                        self.dispatch(&mut tasks, full).await;
                    }
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                self.check_joined(joined);
            }
        }

        self.follower.close().await;

        if !batch.changes.is_empty() {
            self.dispatch(&mut tasks, batch).await;
        }
        while let Some(joined) = tasks.join_next().await {
            self.check_joined(joined);
        }

        let uploader = &self.context.uploader;
        if let Err(e) = uploader.flush().await {
            self.context
                .reporter
                .error(ReplicationError::new(ReplicationStage::Flush, e));
        }
        uploader.stop().await;

        let stats = self.context.reporter.stats.snapshot();
        info!(
            batches = stats.batches,
            docs_written = stats.docs_written,
            failures = stats.doc_write_failures,
            checkpointed_seq = ?stats.checkpointed_seq,
            "Replication finished"
        );
        stats
    }

    fn new_batch(&self, index: u64) -> ChangeBatch {
        ChangeBatch {
            index,
            changes: Vec::with_capacity(self.batch_size),
        }
    }

    /// Start a batch task once a permit is free
    async fn dispatch(&self, tasks: &mut JoinSet<()>, batch: ChangeBatch) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "Batch limiter closed");
                self.context.reporter.error(ReplicationError::new(
                    ReplicationStage::Internal,
                    CouchError::Internal(e.to_string()),
                ));
                return;
            }
        };

        debug!(batch = batch.index, changes = batch.changes.len(), "Dispatching batch");
        let context = self.context.clone();
        tasks.spawn(async move {
            context.process(batch).await;
            drop(permit);
        });
    }

    fn check_joined(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            warn!(error = %e, "Batch task failed");
            self.context.reporter.error(ReplicationError::new(
                ReplicationStage::Internal,
                CouchError::Internal(format!("batch task failed: {}", e)),
            ));
        }
    }
}
