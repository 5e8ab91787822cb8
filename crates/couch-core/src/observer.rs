//! Observation hooks for pool and uploader internals
//!
//! Components take an `Arc<dyn Observer>` at construction and report
//! notable internal events through it. `TracingObserver` turns them into log
//! lines and metrics; `RecordingObserver` keeps them for assertions.

use crate::metrics::{BulkMetrics, ClientMetrics};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a job is being retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The request never produced a response
    Transport,
    /// The server answered with a transient failure status
    Status(u16),
    /// The session expired and was renewed
    SessionExpired(u16),
}

impl RetryReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Status(_) => "status",
            Self::SessionExpired(_) => "session",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => f.write_str("transport error"),
            Self::Status(status) => write!(f, "status {}", status),
            Self::SessionExpired(status) => write!(f, "session expired ({})", status),
        }
    }
}

/// Internal event reported to an [`Observer`]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A worker started an attempt
    RequestStarted {
        method: String,
        url: String,
        attempt: u32,
    },
    /// A job will be resubmitted after `delay`
    RetryScheduled {
        url: String,
        retry: u32,
        delay: Duration,
        reason: RetryReason,
    },
    /// A job ran out of retries; its last outcome is surfaced
    RetriesExhausted { url: String, attempts: u32 },
    /// The session was renewed after a 401/403
    SessionRenewed,
    /// Session renewal failed; the job fails with it
    SessionRenewalFailed { error: String },
    /// A bulk batch was written
    BatchFlushed {
        worker: usize,
        docs: usize,
        bytes: usize,
        status: u16,
    },
    /// A bulk batch failed as a whole
    BatchRejected {
        worker: usize,
        docs: usize,
        error: String,
    },
    /// The server returned a different number of results than documents sent
    ResultCountMismatch {
        worker: usize,
        expected: usize,
        actual: usize,
    },
}

/// Receiver of internal events
pub trait Observer: Send + Sync {
    fn observe(&self, event: &Event);
}

/// Shared observer handle
pub type SharedObserver = Arc<dyn Observer>;

// ============================================================================
// Tracing Observer
// ============================================================================

/// Logs events through `tracing` and records metrics
#[derive(Clone)]
pub struct TracingObserver {
    client: ClientMetrics,
    bulk: BulkMetrics,
}

impl TracingObserver {
    pub fn new(component: impl Into<String>) -> Self {
        let component = component.into();
        Self {
            client: ClientMetrics::new(component.clone()),
            bulk: BulkMetrics::new(component),
        }
    }

    pub fn shared(component: impl Into<String>) -> SharedObserver {
        Arc::new(Self::new(component))
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new("couch-sync")
    }
}

impl Observer for TracingObserver {
    fn observe(&self, event: &Event) {
        match event {
            Event::RequestStarted {
                method,
                url,
                attempt,
            } => {
                self.client.record_request(method);
                debug!(method = %method, url = %url, attempt, "Executing request");
            }
            Event::RetryScheduled {
                url,
                retry,
                delay,
                reason,
            } => {
                self.client.record_retry(reason.label());
                warn!(
                    url = %url,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Retrying request"
                );
            }
            Event::RetriesExhausted { url, attempts } => {
                self.client.record_exhausted();
                warn!(url = %url, attempts, "Retries exhausted");
            }
            Event::SessionRenewed => {
                self.client.record_session_renewal(true);
                info!("Session renewed");
            }
            Event::SessionRenewalFailed { error } => {
                self.client.record_session_renewal(false);
                warn!(error = %error, "Session renewal failed");
            }
            Event::BatchFlushed {
                worker,
                docs,
                bytes,
                status,
            } => {
                self.bulk.record_bulk_request(&status.to_string());
                self.bulk.record_batch_bytes(*bytes);
                debug!(worker, docs, bytes, status, "Bulk batch flushed");
            }
            Event::BatchRejected {
                worker,
                docs,
                error,
            } => {
                self.bulk.record_bulk_request("error");
                self.bulk.record_docs_failed(*docs as u64);
                warn!(worker, docs, error = %error, "Bulk batch failed");
            }
            Event::ResultCountMismatch {
                worker,
                expected,
                actual,
            } => {
                warn!(worker, expected, actual, "Bulk result count mismatch");
            }
        }
    }
}

// ============================================================================
// Recording Observer
// ============================================================================

/// Captures every event, for tests
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the events seen so far
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Retry delays in scheduling order
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::RetryScheduled { delay, .. } => Some(delay),
                _ => None,
            })
            .collect()
    }
}

impl Observer for RecordingObserver {
    fn observe(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
