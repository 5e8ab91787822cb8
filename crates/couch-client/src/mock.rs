//! Scripted in-process transport
//!
//! `MockTransport` answers requests from a handler closure or a fixed reply
//! sequence and records every request with the instant it was sent. Bodies can
//! be streamed line by line and kept open to imitate a continuous feed.

use crate::transport::{ByteStream, HttpRequest, HttpResponse, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use couch_core::error::{CouchError, Result};
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Canned reply
#[derive(Debug, Clone)]
pub struct MockReply {
    status: u16,
    chunks: Vec<Bytes>,
    hold_open: bool,
    transport_error: Option<String>,
}

impl MockReply {
    /// Reply with an empty body
    pub fn status(status: u16) -> Self {
        Self {
            status,
            chunks: Vec::new(),
            hold_open: false,
            transport_error: None,
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::text(status, body.to_string())
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::chunks(status, [body])
    }

    /// Body delivered as the given chunks, unchanged
    pub fn chunks<I, S>(status: u16, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks
                .into_iter()
                .map(|c| Bytes::from(Into::<String>::into(c)))
                .collect(),
            ..Self::status(status)
        }
    }

    /// Body delivered one newline terminated line per chunk
    pub fn lines<I, S>(status: u16, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::chunks(
            status,
            lines.into_iter().map(|l| {
                let mut line: String = l.into();
                line.push('\n');
                line
            }),
        )
    }

    /// Keep the body open after the last chunk, like a live feed
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Fail below HTTP, as a refused connection would
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            transport_error: Some(message.into()),
            ..Self::status(0)
        }
    }

    fn into_response(self) -> Result<HttpResponse> {
        if let Some(message) = self.transport_error {
            return Err(CouchError::transport(message));
        }

        let chunks = futures::stream::iter(self.chunks.into_iter().map(Ok::<_, CouchError>));
        let body: ByteStream = if self.hold_open {
            Box::pin(chunks.chain(futures::stream::pending()))
        } else {
            Box::pin(chunks)
        };
        Ok(HttpResponse::new(self.status, body))
    }
}

/// A request as seen by the mock
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: HttpRequest,
    pub at: Instant,
}

impl RecordedRequest {
    pub fn method(&self) -> &str {
        self.request.method.as_str()
    }

    pub fn path(&self) -> &str {
        self.request.url.path()
    }

    /// First value of a query parameter
    pub fn query(&self, key: &str) -> Option<String> {
        self.request
            .url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn body_json(&self) -> Option<Value> {
        self.request
            .body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }

    pub fn body_str(&self) -> Option<String> {
        self.request
            .body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

type Handler = dyn Fn(&HttpRequest) -> MockReply + Send + Sync;

/// Transport answering from a script
pub struct MockTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Answer every request through `handler`
    pub fn new(handler: impl Fn(&HttpRequest) -> MockReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answer with `replies` in order, repeating the last one
    pub fn sequence(replies: Vec<MockReply>) -> Arc<Self> {
        let next = AtomicUsize::new(0);
        Self::new(move |_| {
            let idx = next.fetch_add(1, Ordering::SeqCst);
            replies
                .get(idx)
                .or_else(|| replies.last())
                .cloned()
                .unwrap_or_else(|| MockReply::status(500))
        })
    }

    /// Answer every request with the same reply
    pub fn always(reply: MockReply) -> Arc<Self> {
        Self::new(move |_| reply.clone())
    }

    /// Requests seen so far, in arrival order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Requests whose path ends with `suffix`
    pub fn requests_to(&self, suffix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path().ends_with(suffix))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                request: request.clone(),
                at: Instant::now(),
            });
        }
        (self.handler)(request).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use url::Url;

    fn get(path: &str) -> HttpRequest {
        HttpRequest::get(Url::parse("http://mock:5984/").unwrap().join(path).unwrap())
    }

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let mock = MockTransport::sequence(vec![MockReply::status(503), MockReply::status(200)]);

        for expected in [503, 200, 200] {
            let resp = mock.send(&get("db")).await.unwrap();
            assert_eq!(resp.status, expected);
        }
        assert_eq!(mock.request_count(), 3);
    }

    #[tokio::test]
    async fn test_lines_reply_streams() {
        let mock = MockTransport::always(MockReply::lines(200, ["", "{\"seq\":1}"]));
        let resp = mock.send(&get("db/_changes")).await.unwrap();
        let mut lines = resp.into_lines();

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("{\"seq\":1}"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transport_error_reply() {
        let mock = MockTransport::always(MockReply::transport_error("refused"));
        let err = mock.send(&get("")).await.unwrap_err();
        assert!(matches!(err, CouchError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_recorded_request_accessors() {
        let mock = MockTransport::always(MockReply::json(200, &json!({"ok": true})));
        let req = HttpRequest::post(Url::parse("http://mock:5984/db/_bulk_get?revs=true").unwrap())
            .json(&json!({"docs": []}))
            .unwrap();
        mock.send(&req).await.unwrap();

        let seen = &mock.requests_to("_bulk_get")[0];
        assert_eq!(seen.method(), "POST");
        assert_eq!(seen.query("revs").as_deref(), Some("true"));
        assert_eq!(seen.body_json().unwrap(), json!({"docs": []}));
    }
}
