//! Bounded worker pool
//!
//! Jobs enter a shared queue. Idle workers offer a private slot to the ready
//! registry, and the dispatcher hands each queued job to the next offered
//! slot. A worker runs one attempt, classifies the outcome and either
//! completes the job or schedules a delayed resubmission through the queue.

use crate::job::Job;
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::transport::{HttpResponse, Transport};
use couch_core::error::{is_auth_status, is_retryable_status, CouchError, Result};
use couch_core::metrics::ClientMetrics;
use couch_core::observer::{Event, RetryReason, SharedObserver};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const QUEUE_CAPACITY: usize = 100;

type Slot = mpsc::Sender<Job>;

/// Outcome classification of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Complete,
    Retry(RetryReason),
}

/// Decide what happens after an attempt
///
/// `renew_session` is true when credentials are configured; without them a
/// 401/403 is final.
pub(crate) fn classify(outcome: &Result<HttpResponse>, is_login: bool, renew_session: bool) -> Verdict {
    match outcome {
        Err(err) if err.is_retryable() => Verdict::Retry(RetryReason::Transport),
        Err(_) => Verdict::Complete,
        Ok(resp) if is_auth_status(resp.status) && !is_login && renew_session => {
            Verdict::Retry(RetryReason::SessionExpired(resp.status))
        }
        Ok(resp) if is_retryable_status(resp.status) => Verdict::Retry(RetryReason::Status(resp.status)),
        Ok(_) => Verdict::Complete,
    }
}

/// State shared by every worker
struct WorkerContext {
    transport: Arc<dyn Transport>,
    session: Option<Session>,
    policy: RetryPolicy,
    observer: SharedObserver,
    metrics: ClientMetrics,
    queue: mpsc::Sender<Job>,
    cancel: CancellationToken,
}

impl WorkerContext {
    async fn execute(&self, worker: usize, mut job: Job) {
        self.observer.observe(&Event::RequestStarted {
            method: job.request.method.to_string(),
            url: job.request.url.to_string(),
            attempt: job.attempts(),
        });

        let started = Instant::now();
        let outcome = self.transport.send(&job.request).await;
        self.metrics.record_latency(started.elapsed());

        let reason = match classify(&outcome, job.is_login, self.session.is_some()) {
            Verdict::Complete => return job.complete(outcome),
            Verdict::Retry(reason) => reason,
        };

        if !self.policy.should_retry(job.retry_count) {
            self.observer.observe(&Event::RetriesExhausted {
                url: job.request.url.to_string(),
                attempts: job.attempts(),
            });
            return job.complete(outcome);
        }

        if let Ok(resp) = outcome {
            resp.drain().await;
        }

        if let (RetryReason::SessionExpired(_), Some(session)) = (reason, &self.session) {
            debug!(worker, "Session expired, logging in again");
            match session.renew(self.transport.as_ref()).await {
                Ok(()) => self.observer.observe(&Event::SessionRenewed),
                Err(err) => {
                    self.observer.observe(&Event::SessionRenewalFailed {
                        error: err.to_string(),
                    });
                    return job.complete(Err(err));
                }
            }
        }

        job.retry_count += 1;
        let delay = self.policy.delay();
        self.observer.observe(&Event::RetryScheduled {
            url: job.request.url.to_string(),
            retry: job.retry_count,
            delay,
            reason,
        });

        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => job.complete(Err(CouchError::Shutdown)),
                _ = tokio::time::sleep(delay) => {
                    if let Err(rejected) = queue.send(job).await {
                        rejected.0.complete(Err(CouchError::Shutdown));
                    }
                }
            }
        });
    }
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>, ready: mpsc::Sender<Slot>) {
    let (slot, mut inbox) = mpsc::channel::<Job>(1);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            offered = ready.send(slot.clone()) => {
                if offered.is_err() {
                    break;
                }
            }
        }

        let job = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            job = inbox.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ctx.execute(id, job) => {}
        }
    }

    debug!(worker = id, "Worker stopped");
}

async fn run_dispatcher(
    mut jobs: mpsc::Receiver<Job>,
    mut ready: mpsc::Receiver<Slot>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            slot = ready.recv() => match slot {
                Some(slot) => slot,
                None => break,
            },
        };

        if let Err(rejected) = slot.send(job).await {
            rejected.0.complete(Err(CouchError::Shutdown));
        }
    }

    debug!("Dispatcher stopped");
}

/// Fixed-size pool of request workers
pub struct Pool {
    queue: mpsc::Sender<Job>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Spawn `workers` workers and the dispatcher
    pub fn start(
        transport: Arc<dyn Transport>,
        session: Option<Session>,
        workers: usize,
        policy: RetryPolicy,
        observer: SharedObserver,
    ) -> Self {
        let workers = workers.max(1);
        let (queue, jobs) = mpsc::channel(QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::channel(workers);
        let cancel = CancellationToken::new();

        let ctx = Arc::new(WorkerContext {
            transport,
            session,
            policy,
            observer,
            metrics: ClientMetrics::new("couch-client"),
            queue: queue.clone(),
            cancel: cancel.clone(),
        });

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(run_dispatcher(jobs, ready_rx, cancel.clone())));
        for id in 0..workers {
            tasks.push(tokio::spawn(run_worker(id, ctx.clone(), ready_tx.clone())));
        }

        info!(workers, "Worker pool started");

        Self {
            queue,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// Queue a job; a stopped pool resolves it with a shutdown error
    pub async fn submit(&self, job: Job) {
        if self.cancel.is_cancelled() {
            return job.complete(Err(CouchError::Shutdown));
        }
        if let Err(rejected) = self.queue.send(job).await {
            rejected.0.complete(Err(CouchError::Shutdown));
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the dispatcher and workers and wait for them to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        info!("Worker pool stopped");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockReply, MockTransport};
    use crate::transport::HttpRequest;
    use couch_core::observer::RecordingObserver;
    use std::time::Duration;
    use url::Url;

    fn request() -> HttpRequest {
        HttpRequest::get(Url::parse("http://mock:5984/db").unwrap())
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(3))
    }

    #[test]
    fn test_classify() {
        let ok = |status| Ok(HttpResponse::from_bytes(status, ""));

        assert_eq!(classify(&ok(200), false, true), Verdict::Complete);
        assert_eq!(classify(&ok(404), false, true), Verdict::Complete);
        assert_eq!(
            classify(&ok(503), false, false),
            Verdict::Retry(RetryReason::Status(503))
        );
        assert_eq!(
            classify(&ok(401), false, true),
            Verdict::Retry(RetryReason::SessionExpired(401))
        );
        // login jobs and credential-less clients never renew
        assert_eq!(classify(&ok(401), true, true), Verdict::Complete);
        assert_eq!(classify(&ok(403), false, false), Verdict::Complete);
        assert_eq!(
            classify(&Err(CouchError::transport("reset")), false, false),
            Verdict::Retry(RetryReason::Transport)
        );
        assert_eq!(classify(&Err(CouchError::Shutdown), false, false), Verdict::Complete);
    }

    #[tokio::test]
    async fn test_success_single_attempt() {
        let mock = MockTransport::always(MockReply::status(200));
        let pool = Pool::start(mock.clone(), None, 2, fast_policy(3), RecordingObserver::new());

        let (job, handle) = Job::new(request());
        pool.submit(job).await;
        let done = handle.wait().await;

        assert_eq!(done.attempts(), 1);
        assert_eq!(done.status(), Some(200));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_response() {
        let mock = MockTransport::always(MockReply::status(503));
        let observer = RecordingObserver::new();
        let pool = Pool::start(mock.clone(), None, 1, fast_policy(2), observer.clone());

        let (job, handle) = Job::new(request());
        pool.submit(job).await;
        let done = handle.wait().await;

        assert_eq!(done.attempts(), 3);
        assert_eq!(done.status(), Some(503));
        assert_eq!(mock.request_count(), 3);
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, Event::RetriesExhausted { attempts: 3, .. })));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_non_retryable_status_is_final() {
        let mock = MockTransport::always(MockReply::status(409));
        let pool = Pool::start(mock.clone(), None, 1, fast_policy(3), RecordingObserver::new());

        let (job, handle) = Job::new(request());
        pool.submit(job).await;

        assert_eq!(handle.wait().await.status(), Some(409));
        assert_eq!(mock.request_count(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_shutdown() {
        let mock = MockTransport::always(MockReply::status(200));
        let pool = Pool::start(mock.clone(), None, 1, fast_policy(0), RecordingObserver::new());
        pool.stop().await;

        let (job, handle) = Job::new(request());
        pool.submit(job).await;

        assert!(matches!(handle.wait().await.error(), Some(CouchError::Shutdown)));
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_resolves_jobs_in_backoff() {
        let mock = MockTransport::always(MockReply::status(503));
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let observer = RecordingObserver::new();
        let pool = Pool::start(mock.clone(), None, 1, policy, observer.clone());

        let (job, handle) = Job::new(request());
        pool.submit(job).await;

        while observer.retry_delays().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        pool.stop().await;

        let done = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(done.error(), Some(CouchError::Shutdown)));
    }
}
