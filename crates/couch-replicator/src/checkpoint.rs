//! Replication log checkpointing
//!
//! Batches finish out of order. A history row is only appended once every
//! earlier batch has been checkpointed, so a resumed run never skips changes
//! of a batch that was still in flight or failed. After a failed batch the
//! rows of later batches are discarded.

use crate::event::{Reporter, ReplicationError, ReplicationEvent, ReplicationStage};
use couch_client::Database;
use couch_core::replication::LogHistoryRow;
use couch_follower::CheckpointStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Pending {
    next: u64,
    ready: BTreeMap<u64, LogHistoryRow>,
    /// Earliest failed batch
    gap: Option<u64>,
}

/// Writes history rows to the source and sink logs in batch order
pub(crate) struct LogWriter {
    id: String,
    source: Database,
    sink: Database,
    progress: Option<Arc<dyn CheckpointStore>>,
    pending: Mutex<Pending>,
}

impl LogWriter {
    pub(crate) fn new(id: impl Into<String>, source: Database, sink: Database) -> Self {
        Self {
            id: id.into(),
            source,
            sink,
            progress: None,
            pending: Mutex::new(Pending {
                next: 0,
                ready: BTreeMap::new(),
                gap: None,
            }),
        }
    }

    /// Also record every written sequence in `store`
    pub(crate) fn with_progress(mut self, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        self.progress = store;
        self
    }

    /// Mark `batch` complete and write every row that is now contiguous
    ///
    /// The lock is held across the writes, serializing the read-modify-write
    /// of both logs within this process.
    pub(crate) async fn complete(&self, batch: u64, row: LogHistoryRow, reporter: &Reporter) {
        let mut pending = self.pending.lock().await;
        if pending.gap.is_some_and(|gap| batch > gap) {
            debug!(batch, "Checkpoint discarded behind a failed batch");
            return;
        }
        pending.ready.insert(batch, row);

        loop {
            let next = pending.next;
            let Some(row) = pending.ready.remove(&next) else {
                break;
            };
            pending.next += 1;

            let seq = row.recorded_seq.clone();
            let mut written = true;
            for db in [&self.source, &self.sink] {
                if let Err(e) = db.write_replication_log(&self.id, row.clone()).await {
                    written = false;
                    reporter.error(ReplicationError::new(ReplicationStage::Checkpoint, e));
                }
            }

            if written {
                debug!(batch = next, seq = ?seq, "Checkpoint written");
                if let (Some(store), Some(seq)) = (&self.progress, &seq) {
                    if let Err(e) = store.save(seq).await {
                        reporter.error(ReplicationError::new(ReplicationStage::Checkpoint, e));
                    }
                }
                reporter.stats.record_checkpoint(seq.clone());
                reporter.event(ReplicationEvent::CheckpointWritten { batch: next, seq });
            }
        }
    }

    /// Mark `batch` as failed
    ///
    /// Batches before it are still checkpointed once they complete. The stall
    /// is reported once per run.
    pub(crate) async fn abandon(&self, batch: u64, reporter: &Reporter) {
        let mut pending = self.pending.lock().await;
        if pending.gap.is_some_and(|gap| gap <= batch) {
            return;
        }

        let first = pending.gap.is_none();
        pending.gap = Some(batch);
        pending.ready.retain(|waiting, _| *waiting < batch);

        if first {
            warn!(batch, "Checkpoints stalled; a rerun resumes before this batch");
            reporter.event(ReplicationEvent::CheckpointStalled { batch });
        }
    }

    /// Batches waiting on an earlier one
    #[cfg(test)]
    pub(crate) async fn waiting(&self) -> usize {
        self.pending.lock().await.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use couch_client::mock::{MockReply, MockTransport};
    use couch_client::CouchClient;
    use couch_core::config::ClientConfig;
    use couch_core::message::Seq;
    use couch_core::metrics::ReplicationMetrics;
    use couch_core::observer::RecordingObserver;
    use couch_follower::MemoryCheckpoint;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn row(seq: &str) -> LogHistoryRow {
        LogHistoryRow {
            session_id: format!("session-{}", seq),
            recorded_seq: Some(Seq::from(seq)),
            start_time: Utc::now(),
            end_time: Utc::now(),
            start_last_seq: None,
            end_last_seq: Some(Seq::from(seq)),
            docs_read: 1,
            docs_written: 1,
            missing_checked: 1,
            missing_found: 1,
            doc_write_failures: 0,
        }
    }

    struct Fixture {
        mock: Arc<MockTransport>,
        writer: LogWriter,
        reporter: Reporter,
        errors: mpsc::UnboundedReceiver<ReplicationError>,
        events: mpsc::UnboundedReceiver<ReplicationEvent>,
    }

    fn fixture() -> Fixture {
        let mock = MockTransport::new(|req| match req.method.as_str() {
            "GET" => MockReply::json(404, &json!({"error": "not_found", "reason": "missing"})),
            _ => MockReply::json(201, &json!({"ok": true, "id": "_local/r", "rev": "0-1"})),
        });
        let client = CouchClient::with_transport(
            &ClientConfig::new("http://mock:5984"),
            mock.clone(),
            RecordingObserver::new(),
        )
        .unwrap();
        let writer = LogWriter::new(
            "r",
            client.database("a").unwrap(),
            client.database("b").unwrap(),
        );
        let (err_tx, errors) = mpsc::unbounded_channel();
        let (ev_tx, events) = mpsc::unbounded_channel();
        let reporter = Reporter::new(err_tx, ev_tx, ReplicationMetrics::new("test"));
        Fixture {
            mock,
            writer,
            reporter,
            errors,
            events,
        }
    }

    fn put_seqs(mock: &MockTransport) -> Vec<String> {
        mock.requests()
            .iter()
            .filter(|r| r.method() == "PUT")
            .map(|r| r.body_json().unwrap()["source_last_seq"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_rows_written_in_batch_order() {
        let Fixture {
            mock,
            writer,
            reporter,
            errors: mut err_rx,
            events: mut ev_rx,
        } = fixture();

        writer.complete(1, row("20"), &reporter).await;
        assert_eq!(writer.waiting().await, 1);
        assert!(mock.requests().is_empty());

        writer.complete(0, row("10"), &reporter).await;
        assert_eq!(writer.waiting().await, 0);

        assert_eq!(put_seqs(&mock), vec!["10", "10", "20", "20"]);

        assert_eq!(
            ev_rx.try_recv().unwrap(),
            ReplicationEvent::CheckpointWritten { batch: 0, seq: Some(Seq::from("10")) }
        );
        assert_eq!(
            ev_rx.try_recv().unwrap(),
            ReplicationEvent::CheckpointWritten { batch: 1, seq: Some(Seq::from("20")) }
        );
        assert!(err_rx.try_recv().is_err());
        assert_eq!(reporter.stats.snapshot().checkpointed_seq, Some(Seq::from("20")));
    }

    #[tokio::test]
    async fn test_progress_store_follows_checkpoints() {
        let store = Arc::new(MemoryCheckpoint::new());
        let mut f = fixture();
        f.writer = f.writer.with_progress(Some(store.clone() as Arc<dyn CheckpointStore>));

        f.writer.complete(0, row("10"), &f.reporter).await;
        f.writer.complete(1, row("20"), &f.reporter).await;

        assert_eq!(store.load().await.unwrap(), Some(Seq::from("20")));
        assert!(f.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_batch_stops_later_checkpoints() {
        let mut f = fixture();

        f.writer.complete(2, row("30"), &f.reporter).await;
        f.writer.abandon(1, &f.reporter).await;
        assert_eq!(f.writer.waiting().await, 0);

        // later batches are dropped instead of queued
        f.writer.complete(3, row("40"), &f.reporter).await;
        f.writer.abandon(4, &f.reporter).await;
        assert_eq!(f.writer.waiting().await, 0);

        // the batch before the gap still lands
        f.writer.complete(0, row("10"), &f.reporter).await;
        assert_eq!(put_seqs(&f.mock), vec!["10", "10"]);

        assert_eq!(
            f.events.try_recv().unwrap(),
            ReplicationEvent::CheckpointStalled { batch: 1 }
        );
        assert_eq!(
            f.events.try_recv().unwrap(),
            ReplicationEvent::CheckpointWritten { batch: 0, seq: Some(Seq::from("10")) }
        );
        assert!(f.events.try_recv().is_err());
        assert!(f.errors.try_recv().is_err());
        assert_eq!(f.reporter.stats.snapshot().checkpointed_seq, Some(Seq::from("10")));
    }
}
