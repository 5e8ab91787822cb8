//! Per-document handles

use bytes::Bytes;
use couch_core::error::{CouchError, Result};
use couch_core::message::DocResult;
use tokio::sync::oneshot;

/// What a bulk job resolves to
///
/// `Ok(None)` means the server gave no per-document result, as in
/// revision-preserving mode.
pub type DocOutcome = Result<Option<DocResult>>;

/// Handle to one uploaded document
#[derive(Debug)]
pub struct BulkJob {
    rx: oneshot::Receiver<DocOutcome>,
}

impl BulkJob {
    /// Job that is already resolved
    pub(crate) fn resolved(outcome: DocOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Wait for the batch holding this document to be written
    pub async fn wait(self) -> DocOutcome {
        self.rx.await.unwrap_or(Err(CouchError::Shutdown))
    }
}

/// Sender half of a [`BulkJob`]
#[derive(Debug)]
pub(crate) struct Completion(oneshot::Sender<DocOutcome>);

impl Completion {
    pub(crate) fn complete(self, outcome: DocOutcome) {
        // fire-and-forget callers dropped the receiver
        let _ = self.0.send(outcome);
    }
}

/// A serialized document on its way to a bulk worker
#[derive(Debug)]
pub(crate) struct PendingDoc {
    pub(crate) body: Bytes,
    pub(crate) priority: bool,
    pub(crate) done: Completion,
}

impl PendingDoc {
    pub(crate) fn new(body: Bytes, priority: bool) -> (Self, BulkJob) {
        let (tx, rx) = oneshot::channel();
        let doc = Self {
            body,
            priority,
            done: Completion(tx),
        };
        (doc, BulkJob { rx })
    }

    pub(crate) fn complete(self, outcome: DocOutcome) {
        self.done.complete(outcome);
    }
}
