//! Progress, error and statistics types of a replication run

use couch_core::error::CouchError;
use couch_core::message::Seq;
use couch_core::metrics::ReplicationMetrics;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

/// Step of the replication protocol an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationStage {
    /// Undecodable row on the source changes feed
    Feed,
    RevsDiff,
    BulkGet,
    Upload,
    Checkpoint,
    /// Final flush of the sink uploader
    Flush,
    Internal,
}

impl ReplicationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationStage::Feed => "feed",
            ReplicationStage::RevsDiff => "revs_diff",
            ReplicationStage::BulkGet => "bulk_get",
            ReplicationStage::Upload => "upload",
            ReplicationStage::Checkpoint => "checkpoint",
            ReplicationStage::Flush => "flush",
            ReplicationStage::Internal => "internal",
        }
    }
}

impl fmt::Display for ReplicationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal failure reported while the run continues
#[derive(Debug, Clone)]
pub struct ReplicationError {
    pub stage: ReplicationStage,
    /// Document the failure belongs to, for per-document upload errors
    pub doc_id: Option<String>,
    pub error: CouchError,
}

impl ReplicationError {
    pub fn new(stage: ReplicationStage, error: CouchError) -> Self {
        Self {
            stage,
            doc_id: None,
            error,
        }
    }

    pub fn for_doc(stage: ReplicationStage, doc_id: impl Into<String>, error: CouchError) -> Self {
        Self {
            stage,
            doc_id: Some(doc_id.into()),
            error,
        }
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.doc_id {
            Some(id) => write!(f, "{} failed for {}: {}", self.stage, id, self.error),
            None => write!(f, "{} failed: {}", self.stage, self.error),
        }
    }
}

/// Progress notification
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// A batch went through diff, fetch and upload
    BatchCompleted {
        batch: u64,
        docs_read: u64,
        missing_found: u64,
        docs_written: u64,
        doc_write_failures: u64,
        last_seq: Option<Seq>,
    },
    /// Both replication logs now record `seq`
    CheckpointWritten { batch: u64, seq: Option<Seq> },
    /// `batch` failed; no later batch of this run is checkpointed
    CheckpointStalled { batch: u64 },
}

/// Totals of a finished run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStats {
    pub batches: u64,
    pub docs_read: u64,
    pub missing_checked: u64,
    pub missing_found: u64,
    pub docs_written: u64,
    pub doc_write_failures: u64,
    pub errors: u64,
    pub checkpoints: u64,
    /// Last checkpointed source sequence
    pub checkpointed_seq: Option<Seq>,
}

/// Counters shared by the batch tasks
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    batches: AtomicU64,
    docs_read: AtomicU64,
    missing_checked: AtomicU64,
    missing_found: AtomicU64,
    docs_written: AtomicU64,
    doc_write_failures: AtomicU64,
    errors: AtomicU64,
    checkpoints: AtomicU64,
    checkpointed_seq: Mutex<Option<Seq>>,
}

impl StatsRecorder {
    pub(crate) fn record_batch(&self, summary: &BatchSummary) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.docs_read.fetch_add(summary.docs_read, Ordering::Relaxed);
        self.missing_checked
            .fetch_add(summary.missing_checked, Ordering::Relaxed);
        self.missing_found
            .fetch_add(summary.missing_found, Ordering::Relaxed);
        self.docs_written
            .fetch_add(summary.docs_written, Ordering::Relaxed);
        self.doc_write_failures
            .fetch_add(summary.doc_write_failures, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self, seq: Option<Seq>) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut current) = self.checkpointed_seq.lock() {
            *current = seq;
        }
    }

    pub(crate) fn snapshot(&self) -> ReplicationStats {
        ReplicationStats {
            batches: self.batches.load(Ordering::Relaxed),
            docs_read: self.docs_read.load(Ordering::Relaxed),
            missing_checked: self.missing_checked.load(Ordering::Relaxed),
            missing_found: self.missing_found.load(Ordering::Relaxed),
            docs_written: self.docs_written.load(Ordering::Relaxed),
            doc_write_failures: self.doc_write_failures.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            checkpointed_seq: self
                .checkpointed_seq
                .lock()
                .ok()
                .and_then(|s| s.clone()),
        }
    }
}

/// Counters of one processed batch
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct BatchSummary {
    pub docs_read: u64,
    pub missing_checked: u64,
    pub missing_found: u64,
    pub docs_written: u64,
    pub doc_write_failures: u64,
}

/// Fan-out of errors and progress to the run's channels, stats and metrics
#[derive(Clone)]
pub(crate) struct Reporter {
    errors: mpsc::UnboundedSender<ReplicationError>,
    events: mpsc::UnboundedSender<ReplicationEvent>,
    pub(crate) stats: Arc<StatsRecorder>,
    pub(crate) metrics: ReplicationMetrics,
}

impl Reporter {
    pub(crate) fn new(
        errors: mpsc::UnboundedSender<ReplicationError>,
        events: mpsc::UnboundedSender<ReplicationEvent>,
        metrics: ReplicationMetrics,
    ) -> Self {
        Self {
            errors,
            events,
            stats: Arc::new(StatsRecorder::default()),
            metrics,
        }
    }

    pub(crate) fn error(&self, err: ReplicationError) {
        warn!(stage = %err.stage, doc_id = ?err.doc_id, error = %err.error, "Replication error");
        self.stats.record_error();
        self.metrics.record_error(err.stage.as_str());
        // receiver may have been dropped by an owner not interested in errors
        let _ = self.errors.send(err);
    }

    pub(crate) fn event(&self, event: ReplicationEvent) {
        let _ = self.events.send(event);
    }
}
