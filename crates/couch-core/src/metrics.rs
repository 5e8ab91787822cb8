//! Metrics for couch-sync
//!
//! Thin recorder structs over the `metrics` facade. Nothing is exported unless
//! the embedding application installs a recorder.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Client / pool metrics
    pub const CLIENT_REQUESTS_TOTAL: &str = "couch_client_requests_total";
    pub const CLIENT_RETRIES_TOTAL: &str = "couch_client_retries_total";
    pub const CLIENT_RETRIES_EXHAUSTED: &str = "couch_client_retries_exhausted_total";
    pub const CLIENT_SESSION_RENEWALS: &str = "couch_client_session_renewals_total";
    pub const CLIENT_REQUEST_LATENCY: &str = "couch_client_request_latency_seconds";

    // Bulk metrics
    pub const BULK_REQUESTS_TOTAL: &str = "couch_bulk_requests_total";
    pub const BULK_DOCS_WRITTEN: &str = "couch_bulk_docs_written_total";
    pub const BULK_DOCS_FAILED: &str = "couch_bulk_docs_failed_total";
    pub const BULK_BATCH_BYTES: &str = "couch_bulk_batch_bytes";
    pub const BULK_LATENCY: &str = "couch_bulk_latency_seconds";

    // Follower metrics
    pub const FOLLOWER_CHANGES_TOTAL: &str = "couch_follower_changes_total";
    pub const FOLLOWER_ERRORS_TOTAL: &str = "couch_follower_errors_total";
    pub const FOLLOWER_CONNECTED: &str = "couch_follower_connected";

    // Replication metrics
    pub const REPLICATION_BATCHES_TOTAL: &str = "couch_replication_batches_total";
    pub const REPLICATION_DOCS_READ: &str = "couch_replication_docs_read_total";
    pub const REPLICATION_DOCS_WRITTEN: &str = "couch_replication_docs_written_total";
    pub const REPLICATION_MISSING_FOUND: &str = "couch_replication_missing_found_total";
    pub const REPLICATION_ERRORS_TOTAL: &str = "couch_replication_errors_total";
    pub const REPLICATION_BATCH_LATENCY: &str = "couch_replication_batch_latency_seconds";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const METHOD: &str = "method";
    pub const STATUS: &str = "status";
    pub const REASON: &str = "reason";
    pub const OPERATION: &str = "operation";
    pub const ERROR_TYPE: &str = "error_type";
}

/// Worker pool metrics
#[derive(Clone)]
pub struct ClientMetrics {
    component: String,
}

impl ClientMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record an attempt
    pub fn record_request(&self, method: &str) {
        counter!(
            names::CLIENT_REQUESTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::METHOD => method.to_string(),
        )
        .increment(1);
    }

    /// Record a scheduled retry
    pub fn record_retry(&self, reason: &str) {
        counter!(
            names::CLIENT_RETRIES_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    pub fn record_exhausted(&self) {
        counter!(
            names::CLIENT_RETRIES_EXHAUSTED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Record a session renewal attempt
    pub fn record_session_renewal(&self, ok: bool) {
        counter!(
            names::CLIENT_SESSION_RENEWALS,
            labels::COMPONENT => self.component.clone(),
            labels::STATUS => if ok { "ok" } else { "failed" },
        )
        .increment(1);
    }

    pub fn record_latency(&self, duration: Duration) {
        histogram!(
            names::CLIENT_REQUEST_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Bulk uploader metrics
#[derive(Clone)]
pub struct BulkMetrics {
    component: String,
}

impl BulkMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record bulk request
    pub fn record_bulk_request(&self, status: &str) {
        counter!(
            names::BULK_REQUESTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    pub fn record_docs_written(&self, count: u64) {
        counter!(
            names::BULK_DOCS_WRITTEN,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(count);
    }

    pub fn record_docs_failed(&self, count: u64) {
        counter!(
            names::BULK_DOCS_FAILED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(count);
    }

    /// Record the body size of a flushed batch
    pub fn record_batch_bytes(&self, bytes: usize) {
        histogram!(
            names::BULK_BATCH_BYTES,
            labels::COMPONENT => self.component.clone(),
        )
        .record(bytes as f64);
    }

    pub fn record_bulk_latency(&self, duration: Duration) {
        histogram!(
            names::BULK_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Changes follower metrics
#[derive(Clone)]
pub struct FollowerMetrics {
    component: String,
}

impl FollowerMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record a change event
    pub fn record_change(&self, operation: &str) {
        counter!(
            names::FOLLOWER_CHANGES_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::FOLLOWER_ERRORS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    /// Set feed state (1 = streaming, 0 = closed)
    pub fn set_connected(&self, connected: bool) {
        gauge!(
            names::FOLLOWER_CONNECTED,
            labels::COMPONENT => self.component.clone(),
        )
        .set(if connected { 1.0 } else { 0.0 });
    }
}

/// Replication metrics
#[derive(Clone)]
pub struct ReplicationMetrics {
    component: String,
}

impl ReplicationMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record a completed batch and its counters
    pub fn record_batch(&self, docs_read: u64, missing_found: u64, docs_written: u64) {
        counter!(
            names::REPLICATION_BATCHES_TOTAL,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
        counter!(
            names::REPLICATION_DOCS_READ,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(docs_read);
        counter!(
            names::REPLICATION_MISSING_FOUND,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(missing_found);
        counter!(
            names::REPLICATION_DOCS_WRITTEN,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(docs_written);
    }

    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::REPLICATION_ERRORS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    pub fn record_batch_latency(&self, duration: Duration) {
        histogram!(
            names::REPLICATION_BATCH_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer_records_once() {
        let mut calls = 0;
        {
            let timer = LatencyTimer::start(|_| calls += 1);
            timer.stop();
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_recorders_without_installed_recorder() {
        // the facade is a no-op until a recorder is installed
        ClientMetrics::new("test").record_retry("status");
        BulkMetrics::new("test").record_batch_bytes(42);
        FollowerMetrics::new("test").set_connected(true);
        ReplicationMetrics::new("test").record_batch(3, 2, 2);
    }
}
