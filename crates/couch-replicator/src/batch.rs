//! Processing of one batch of source changes

use crate::checkpoint::LogWriter;
use crate::event::{BatchSummary, Reporter, ReplicationError, ReplicationEvent, ReplicationStage};
use chrono::Utc;
use couch_bulk::Uploader;
use couch_client::Database;
use couch_core::error::CouchError;
use couch_core::message::{BulkGetRequest, DocChange, RevsDiffRequest, Seq};
use couch_core::metrics::LatencyTimer;
use couch_core::replication::LogHistoryRow;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Changes accumulated from the feed, in sequence order
#[derive(Debug, Default)]
pub(crate) struct ChangeBatch {
    pub index: u64,
    pub changes: Vec<DocChange>,
}

impl ChangeBatch {
    fn first_seq(&self) -> Option<Seq> {
        self.changes.iter().find_map(|c| c.seq.clone())
    }

    /// Last sequence covered by the batch
    fn last_seq(&self) -> Option<Seq> {
        self.changes.iter().rev().find_map(|c| c.seq.clone())
    }
}

/// Everything a batch task needs, shared between tasks
pub(crate) struct BatchContext {
    pub source: Database,
    pub sink: Database,
    pub uploader: Arc<Uploader>,
    pub log: LogWriter,
    pub reporter: Reporter,
}

impl BatchContext {
    /// Replicate one batch, then checkpoint it or mark it failed
    #[instrument(skip_all, fields(batch = batch.index, changes = batch.changes.len()))]
    pub(crate) async fn process(&self, batch: ChangeBatch) {
        match self.replicate(&batch).await {
            Some(row) => self.log.complete(batch.index, row, &self.reporter).await,
            None => self.log.abandon(batch.index, &self.reporter).await,
        }
    }

    /// Diff, fetch and upload; the history row when the batch may be checkpointed
    ///
    /// Failures are reported and never abort the run. Revisions rejected one by
    /// one count as write failures and still allow the checkpoint. A failed
    /// diff, fetch or bulk request does not.
    async fn replicate(&self, batch: &ChangeBatch) -> Option<LogHistoryRow> {
        let started = Utc::now();
        let metrics = self.reporter.metrics.clone();
        let _timer = LatencyTimer::start(move |d| metrics.record_batch_latency(d));

        let mut diff = RevsDiffRequest::new();
        for change in &batch.changes {
            diff.add(change.meta.id.clone(), change.meta.rev.clone());
        }
        let mut summary = BatchSummary {
            docs_read: batch.changes.len() as u64,
            missing_checked: diff.len() as u64,
            ..Default::default()
        };

        let missing = match self.sink.revs_diff(&diff).await {
            Ok(missing) => missing,
            Err(e) => {
                self.reporter
                    .error(ReplicationError::new(ReplicationStage::RevsDiff, e));
                return None;
            }
        };
        summary.missing_found = missing.missing_count() as u64;

        let mut upload_failed = false;
        if summary.missing_found > 0 {
            let request: BulkGetRequest = missing.missing().collect();
            let fetched = match self.source.bulk_get(&request).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.reporter
                        .error(ReplicationError::new(ReplicationStage::BulkGet, e));
                    return None;
                }
            };

            for err in fetched.errors() {
                summary.doc_write_failures += 1;
                self.reporter.error(ReplicationError::for_doc(
                    ReplicationStage::BulkGet,
                    err.id.clone(),
                    CouchError::from(&err),
                ));
            }

            let mut jobs = Vec::new();
            for doc in fetched.documents() {
                let id = doc
                    .get("_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                jobs.push((id, self.uploader.upload(doc).await));
            }
            self.uploader.async_flush().await;

            for (id, job) in jobs {
                match job.wait().await {
                    Ok(_) => summary.docs_written += 1,
                    Err(e @ CouchError::Document { .. }) => {
                        summary.doc_write_failures += 1;
                        self.reporter
                            .error(ReplicationError::for_doc(ReplicationStage::Upload, id, e));
                    }
                    Err(e) => {
                        summary.doc_write_failures += 1;
                        // every job of a failed request carries the same error
                        if !upload_failed {
                            self.reporter
                                .error(ReplicationError::new(ReplicationStage::Upload, e));
                        }
                        upload_failed = true;
                    }
                }
            }
        }

        let last_seq = batch.last_seq();
        debug!(
            missing = summary.missing_found,
            written = summary.docs_written,
            failures = summary.doc_write_failures,
            last_seq = ?last_seq,
            "Batch replicated"
        );
        self.reporter.stats.record_batch(&summary);
        self.reporter.metrics.record_batch(
            summary.docs_read,
            summary.missing_found,
            summary.docs_written,
        );
        self.reporter.event(ReplicationEvent::BatchCompleted {
            batch: batch.index,
            docs_read: summary.docs_read,
            missing_found: summary.missing_found,
            docs_written: summary.docs_written,
            doc_write_failures: summary.doc_write_failures,
            last_seq: last_seq.clone(),
        });

        if upload_failed {
            return None;
        }

        Some(LogHistoryRow {
            session_id: Uuid::new_v4().to_string(),
            recorded_seq: last_seq.clone(),
            start_time: started,
            end_time: Utc::now(),
            start_last_seq: batch.first_seq(),
            end_last_seq: last_seq,
            docs_read: summary.docs_read,
            docs_written: summary.docs_written,
            missing_checked: summary.missing_checked,
            missing_found: summary.missing_found,
            doc_write_failures: summary.doc_write_failures,
        })
    }
}
