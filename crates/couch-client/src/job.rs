//! Jobs executed by the worker pool

use crate::transport::{HttpRequest, HttpResponse};
use couch_core::error::{CouchError, Result};
use tokio::sync::oneshot;

/// A request travelling through the pool
///
/// A job is owned by exactly one party at a time: the queue, a worker, or a
/// backoff timer waiting to resubmit it.
#[derive(Debug)]
pub struct Job {
    pub(crate) request: HttpRequest,
    pub(crate) retry_count: u32,
    pub(crate) is_login: bool,
    done: Option<oneshot::Sender<CompletedJob>>,
}

impl Job {
    pub fn new(request: HttpRequest) -> (Self, JobHandle) {
        Self::build(request, false)
    }

    /// Session login job; never retried through session renewal
    pub fn login(request: HttpRequest) -> (Self, JobHandle) {
        Self::build(request, true)
    }

    fn build(request: HttpRequest, is_login: bool) -> (Self, JobHandle) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            request,
            retry_count: 0,
            is_login,
            done: Some(tx),
        };
        (job, JobHandle { rx })
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Attempts made so far, including the one in progress
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_login(&self) -> bool {
        self.is_login
    }

    /// Resolve the caller's handle
    pub(crate) fn complete(mut self, outcome: Result<HttpResponse>) {
        let attempts = self.attempts();
        if let Some(done) = self.done.take() {
            // the caller may have stopped waiting
            let _ = done.send(CompletedJob { attempts, outcome });
        }
    }
}

/// Caller side of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<CompletedJob>,
}

impl JobHandle {
    /// Wait for the job to finish
    ///
    /// A job dropped by a stopping pool resolves with [`CouchError::Shutdown`].
    pub async fn wait(self) -> CompletedJob {
        self.rx.await.unwrap_or_else(|_| CompletedJob {
            attempts: 0,
            outcome: Err(CouchError::Shutdown),
        })
    }
}

/// Final state of a job
#[derive(Debug)]
pub struct CompletedJob {
    attempts: u32,
    outcome: Result<HttpResponse>,
}

impl CompletedJob {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Status of the final response, if one was received
    pub fn status(&self) -> Option<u16> {
        self.outcome.as_ref().ok().map(|r| r.status)
    }

    pub fn error(&self) -> Option<&CouchError> {
        self.outcome.as_ref().err()
    }

    pub fn into_response(self) -> Result<HttpResponse> {
        self.outcome
    }

    /// Release the response body
    pub async fn close(self) {
        if let Ok(resp) = self.outcome {
            resp.drain().await;
        }
    }
}
