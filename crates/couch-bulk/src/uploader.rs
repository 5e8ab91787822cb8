//! Batching uploader for `_bulk_docs`
//!
//! Documents are routed by a dispatcher to the next ready bulk worker. Each
//! worker owns one batch and flushes it when a count, byte or priority
//! trigger fires. Flush and stop commands are broadcast to every worker in
//! queue order, so a flush covers everything submitted before it.

use crate::batch::Batch;
use crate::job::{BulkJob, Completion, PendingDoc};
use bytes::Bytes;
use couch_client::{expect_status, CouchClient, Database};
use couch_core::config::BulkConfig;
use couch_core::error::{CouchError, Result};
use couch_core::message::DocResult;
use couch_core::metrics::BulkMetrics;
use couch_core::observer::{Event, SharedObserver};
use reqwest::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

const COMMAND_CAPACITY: usize = 1000;
const INBOX_CAPACITY: usize = 16;

/// Commands accepted by the dispatcher
enum Command {
    Upload(PendingDoc),
    Flush(Option<oneshot::Sender<()>>),
    Stop(oneshot::Sender<()>),
}

/// Commands accepted by a bulk worker
enum WorkerCommand {
    Upload(PendingDoc),
    Flush(Option<oneshot::Sender<()>>),
    Stop(oneshot::Sender<()>),
}

// ============================================================================
// Bulk worker
// ============================================================================

struct BulkWorker {
    id: usize,
    batch: Batch,
    client: CouchClient,
    url: Url,
    config: BulkConfig,
    observer: SharedObserver,
    metrics: BulkMetrics,
}

impl BulkWorker {
    async fn run(mut self, mut inbox: mpsc::Receiver<WorkerCommand>, ready: mpsc::Sender<usize>) {
        if ready.send(self.id).await.is_err() {
            return;
        }

        while let Some(command) = inbox.recv().await {
            match command {
                WorkerCommand::Upload(doc) => {
                    self.add(doc).await;
                    if ready.send(self.id).await.is_err() {
                        break;
                    }
                }
                WorkerCommand::Flush(ack) => {
                    self.flush().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                WorkerCommand::Stop(ack) => {
                    self.flush().await;
                    let _ = ack.send(());
                    break;
                }
            }
        }

        // only reached without a stop when the uploader was dropped
        let (_, pending) = self.batch.take();
        fail_all(pending, &CouchError::Shutdown);
        debug!(worker = self.id, "Bulk worker stopped");
    }

    async fn add(&mut self, doc: PendingDoc) {
        if self
            .batch
            .would_overflow(doc.body.len(), self.config.batch_size, self.config.max_bytes)
        {
            self.flush().await;
        }

        let priority = self.batch.push(doc);
        if priority || self.batch.len() >= self.config.batch_size {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let (body, pending) = self.batch.take();
        let docs = pending.len();
        let bytes = body.len();

        if let Some(max) = self.config.max_bytes {
            if bytes > max {
                let err = CouchError::BatchTooLarge { size: bytes, max };
                self.reject(pending, &err);
                return;
            }
        }

        let started = Instant::now();
        let req = self.client.request(Method::POST, self.url.clone()).raw_json(body);
        let outcome = match self.client.execute(req).await {
            Ok(resp) => expect_status(resp, &[201, 202]).await,
            Err(err) => Err(err),
        };
        self.metrics.record_bulk_latency(started.elapsed());

        let resp = match outcome {
            Ok(resp) => resp,
            Err(err) => return self.reject(pending, &err),
        };
        let status = resp.status;

        if !self.config.new_edits {
            resp.drain().await;
            for done in pending {
                done.complete(Ok(None));
            }
        } else {
            let results: Vec<DocResult> = match resp.json().await {
                Ok(results) => results,
                Err(err) => return self.reject(pending, &err),
            };
            self.correlate(pending, results);
        }

        self.observer.observe(&Event::BatchFlushed {
            worker: self.id,
            docs,
            bytes,
            status,
        });
    }

    /// Complete jobs from results matched by position
    fn correlate(&self, pending: Vec<Completion>, results: Vec<DocResult>) {
        if results.len() != pending.len() {
            self.observer.observe(&Event::ResultCountMismatch {
                worker: self.id,
                expected: pending.len(),
                actual: results.len(),
            });
        }

        let mut written = 0u64;
        let mut failed = 0u64;
        let mut results = results.into_iter();
        for done in pending {
            match results.next() {
                Some(result) => {
                    let outcome = result.into_result();
                    if outcome.is_ok() {
                        written += 1;
                    } else {
                        failed += 1;
                    }
                    done.complete(outcome.map(Some));
                }
                None => done.complete(Ok(None)),
            }
        }

        self.metrics.record_docs_written(written);
        self.metrics.record_docs_failed(failed);
    }

    fn reject(&self, pending: Vec<Completion>, err: &CouchError) {
        self.observer.observe(&Event::BatchRejected {
            worker: self.id,
            docs: pending.len(),
            error: err.to_string(),
        });
        fail_all(pending, err);
    }
}

fn fail_all(pending: Vec<Completion>, err: &CouchError) {
    for done in pending {
        done.complete(Err(err.clone()));
    }
}

// ============================================================================
// Dispatcher and timer
// ============================================================================

/// Send `make(ack)` to every worker and collect the acknowledgements
async fn broadcast(
    inboxes: &[mpsc::Sender<WorkerCommand>],
    make: impl Fn(oneshot::Sender<()>) -> WorkerCommand,
) -> Vec<oneshot::Receiver<()>> {
    let mut acks = Vec::with_capacity(inboxes.len());
    for inbox in inboxes {
        let (tx, rx) = oneshot::channel();
        if inbox.send(make(tx)).await.is_ok() {
            acks.push(rx);
        }
    }
    acks
}

async fn run_dispatcher(
    mut commands: mpsc::Receiver<Command>,
    mut ready: mpsc::Receiver<usize>,
    inboxes: Vec<mpsc::Sender<WorkerCommand>>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Upload(doc) => {
                let worker = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    worker = ready.recv() => worker,
                };
                let Some(worker) = worker else {
                    doc.complete(Err(CouchError::Shutdown));
                    break;
                };
                if let Err(rejected) = inboxes[worker].send(WorkerCommand::Upload(doc)).await {
                    if let WorkerCommand::Upload(doc) = rejected.0 {
                        doc.complete(Err(CouchError::Shutdown));
                    }
                }
            }
            Command::Flush(None) => {
                for inbox in &inboxes {
                    let _ = inbox.send(WorkerCommand::Flush(None)).await;
                }
            }
            Command::Flush(Some(ack)) => {
                let acks = broadcast(&inboxes, |tx| WorkerCommand::Flush(Some(tx))).await;
                tokio::spawn(async move {
                    for rx in acks {
                        let _ = rx.await;
                    }
                    let _ = ack.send(());
                });
            }
            Command::Stop(ack) => {
                let acks = broadcast(&inboxes, WorkerCommand::Stop).await;
                for rx in acks {
                    let _ = rx.await;
                }
                let _ = ack.send(());
                break;
            }
        }
    }

    // later commands fail through the closed channel
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Command::Upload(doc) = command {
            doc.complete(Err(CouchError::Shutdown));
        }
    }
    debug!("Bulk dispatcher stopped");
}

async fn run_timer(period: Duration, commands: mpsc::Sender<Command>, cancel: CancellationToken) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if commands.send(Command::Flush(None)).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Uploader
// ============================================================================

/// Batching writer for one database
pub struct Uploader {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Uploader {
    /// Uploader reporting to the client's observer
    pub fn new(database: &Database, config: BulkConfig) -> Result<Self> {
        let observer = database.client().observer();
        Self::with_observer(database, config, observer)
    }

    pub fn with_observer(database: &Database, config: BulkConfig, observer: SharedObserver) -> Result<Self> {
        if config.batch_size == 0 || config.concurrency == 0 {
            return Err(CouchError::config(
                "bulk batch_size and concurrency must be at least 1",
            ));
        }

        let url = database.bulk_docs_url()?;
        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::channel(config.concurrency);

        let mut tasks = Vec::with_capacity(config.concurrency + 2);
        let mut inboxes = Vec::with_capacity(config.concurrency);
        for id in 0..config.concurrency {
            let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
            let worker = BulkWorker {
                id,
                batch: Batch::new(config.new_edits),
                client: database.client().clone(),
                url: url.clone(),
                config: config.clone(),
                observer: observer.clone(),
                metrics: BulkMetrics::new(format!("couch-bulk/{}", database.name())),
            };
            tasks.push(tokio::spawn(worker.run(inbox_rx, ready_tx.clone())));
            inboxes.push(inbox_tx);
        }

        tasks.push(tokio::spawn(run_dispatcher(
            commands_rx,
            ready_rx,
            inboxes,
            cancel.clone(),
        )));

        if let Some(period) = config.flush_interval {
            tasks.push(tokio::spawn(run_timer(period, commands_tx.clone(), cancel.clone())));
        }

        info!(
            db = database.name(),
            workers = config.concurrency,
            batch_size = config.batch_size,
            max_bytes = ?config.max_bytes,
            new_edits = config.new_edits,
            "Bulk uploader started"
        );

        Ok(Self {
            commands: commands_tx,
            cancel,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    async fn enqueue<T: Serialize + ?Sized>(&self, doc: &T, priority: bool) -> BulkJob {
        if self.stopped.load(Ordering::SeqCst) {
            return BulkJob::resolved(Err(CouchError::Shutdown));
        }

        let body = match serde_json::to_vec(doc) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                return BulkJob::resolved(Err(CouchError::serialization(
                    "Document serialization failed",
                    err,
                )))
            }
        };

        let (pending, job) = PendingDoc::new(body, priority);
        if let Err(rejected) = self.commands.send(Command::Upload(pending)).await {
            if let Command::Upload(pending) = rejected.0 {
                pending.complete(Err(CouchError::Shutdown));
            }
        }
        job
    }

    /// Queue a document for the next batch
    pub async fn upload<T: Serialize + ?Sized>(&self, doc: &T) -> BulkJob {
        self.enqueue(doc, false).await
    }

    /// Queue a document and flush its batch right away
    pub async fn upload_now<T: Serialize + ?Sized>(&self, doc: &T) -> BulkJob {
        self.enqueue(doc, true).await
    }

    /// Queue a document without keeping its handle
    pub async fn fire_and_forget<T: Serialize + ?Sized>(&self, doc: &T) {
        drop(self.enqueue(doc, false).await);
    }

    /// Flush every worker and wait until all earlier documents are written
    pub async fn flush(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CouchError::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(Some(tx)))
            .await
            .map_err(|_| CouchError::Shutdown)?;
        rx.await.map_err(|_| CouchError::Shutdown)
    }

    /// Ask every worker to flush without waiting
    pub async fn async_flush(&self) {
        if !self.stopped.load(Ordering::SeqCst) {
            let _ = self.commands.send(Command::Flush(None)).await;
        }
    }

    /// Flush outstanding batches, then stop all tasks
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        info!("Bulk uploader stopped");
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
