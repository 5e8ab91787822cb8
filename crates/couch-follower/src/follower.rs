//! Continuous changes feed consumer
//!
//! `follow()` opens `_changes?feed=continuous` and spawns a reader task that
//! turns each line into a [`ChangeEvent`]. The last seen sequence is
//! published through a watch channel so the owner can checkpoint it.

use couch_client::{expect_status, Database, LineReader};
use couch_core::config::FollowerConfig;
use couch_core::error::{CouchError, Result};
use couch_core::message::{ChangeEvent, ChangeRow, Seq, CHANGE_ROW_MARKER};
use couch_core::metrics::FollowerMetrics;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1000;

/// Events of one `follow()` call
pub struct ChangeStream {
    rx: mpsc::Receiver<ChangeEvent>,
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Changes feed follower for one database
pub struct Follower {
    db: Database,
    config: FollowerConfig,
    position: watch::Sender<Option<Seq>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Follower {
    pub fn new(db: Database, config: FollowerConfig) -> Self {
        let (position, _) = watch::channel(None);
        Self {
            db,
            config,
            position,
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Start from `since` instead of the beginning of the feed
    pub fn with_since(self, since: Option<Seq>) -> Self {
        self.position.send_replace(since);
        self
    }

    /// Last sequence seen on the feed, or the starting position
    pub fn last_seq(&self) -> Option<Seq> {
        self.position.borrow().clone()
    }

    /// Watch position updates
    pub fn subscribe(&self) -> watch::Receiver<Option<Seq>> {
        self.position.subscribe()
    }

    /// True until the reader task has stopped
    pub fn is_following(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Query pairs of the feed request
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("feed", "continuous".to_string()),
            ("heartbeat", self.config.heartbeat.as_millis().to_string()),
            ("timeout", self.config.timeout.as_millis().to_string()),
            ("include_docs", self.config.include_docs.to_string()),
        ];
        if let Some(since) = self.last_seq() {
            params.push(("since", since.into_string()));
        }
        if let Some(interval) = self.config.seq_interval {
            params.push(("seq_interval", interval.to_string()));
        }
        params
    }

    /// Open the feed and start reading it
    ///
    /// A non-200 answer is returned as the error. Calling `follow()` again
    /// after `close()` resumes from [`last_seq`](Self::last_seq).
    pub async fn follow(&mut self) -> Result<ChangeStream> {
        if self.is_following() {
            return Err(CouchError::InvalidState("follower is already running".to_string()));
        }

        let params = self.params();
        let req = self
            .db
            .changes_request(params.iter().map(|(k, v)| (*k, v.as_str())))?;
        let resp = self.db.client().execute(req).await?;
        let resp = expect_status(resp, &[200]).await?;

        info!(db = self.db.name(), since = ?self.last_seq(), "Following changes");

        self.cancel = CancellationToken::new();
        self.running.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let reader = FeedReader {
            lines: resp.into_lines(),
            events: tx,
            position: self.position.clone(),
            cancel: self.cancel.clone(),
            running: self.running.clone(),
            metrics: FollowerMetrics::new(format!("couch-follower/{}", self.db.name())),
        };
        self.task = Some(tokio::spawn(reader.run()));

        Ok(ChangeStream { rx })
    }

    /// Stop the reader task and wait for it to exit
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(db = self.db.name(), last_seq = ?self.last_seq(), "Follower closed");
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reader task state
struct FeedReader {
    lines: LineReader,
    events: mpsc::Sender<ChangeEvent>,
    position: watch::Sender<Option<Seq>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    metrics: FollowerMetrics,
}

impl FeedReader {
    async fn run(mut self) {
        self.metrics.set_connected(true);

        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                line = self.lines.next_line() => line,
            };

            let (event, seq) = match line {
                Ok(Some(line)) => match decode_line(&line) {
                    Some(decoded) => decoded,
                    None => continue,
                },
                Ok(None) => (ChangeEvent::Terminated, None),
                Err(err @ CouchError::Decode { .. }) => (ChangeEvent::Error(err), None),
                Err(err) => {
                    warn!(error = %err, "Changes feed read failed");
                    self.metrics.record_error("read");
                    (ChangeEvent::Terminated, None)
                }
            };

            if seq.is_some() {
                self.position.send_replace(seq);
            }
            if let ChangeEvent::Error(err) = &event {
                warn!(error = %err, "Undecodable change row");
                self.metrics.record_error("decode");
            }
            self.metrics.record_change(event.kind().as_str());

            let terminated = matches!(event, ChangeEvent::Terminated);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = self.events.send(event) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            if terminated {
                break;
            }
        }

        self.metrics.set_connected(false);
        // cleared before the event sender drops
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Turn one feed line into an event; `None` for lines that carry no change
pub fn parse_line(line: &str) -> Option<ChangeEvent> {
    decode_line(line).map(|(event, _)| event)
}

/// Event of a line plus the sequence it moves the position to
///
/// A decoded row moves the position even when its event is an error.
fn decode_line(line: &str) -> Option<(ChangeEvent, Option<Seq>)> {
    let line = line.trim();
    let line = line.strip_suffix(',').unwrap_or(line);

    if line.is_empty() {
        return Some((ChangeEvent::Heartbeat, None));
    }
    if !line.starts_with(CHANGE_ROW_MARKER) {
        return None;
    }

    Some(match serde_json::from_str::<ChangeRow>(line) {
        Ok(row) => {
            let seq = row.seq.clone();
            (ChangeEvent::from_row(row), seq)
        }
        Err(e) => (
            ChangeEvent::Error(CouchError::decode_with_source("Invalid change row", e)),
            None,
        ),
    })
}
