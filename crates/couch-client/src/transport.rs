//! HTTP transport seam
//!
//! Workers execute requests through the [`Transport`] trait. Production code
//! uses [`ReqwestTransport`]; tests script replies with `MockTransport`.

use crate::lines::LineReader;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use couch_core::config::ClientConfig;
use couch_core::error::{CouchError, Result};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tracing::trace;
use url::Url;

/// `User-Agent` sent with every request
pub const CLIENT_USER_AGENT: &str = concat!("couch-sync/", env!("CARGO_PKG_VERSION"));

/// Streamed response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

// ============================================================================
// Request
// ============================================================================

/// Outbound request
///
/// The body is an immutable `Bytes` buffer so a retried job replays exactly
/// the same payload.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Overall deadline; `None` disables it (used by the changes feed)
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        Self {
            method,
            url,
            headers,
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: Url) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: Url) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Serialize `body` as the JSON payload
    pub fn json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(self.raw_json(Bytes::from(bytes)))
    }

    /// Use an already serialized JSON payload
    pub fn raw_json(mut self, body: Bytes) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(body);
        self
    }

    /// URL-encoded form payload
    pub fn form<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self.body = Some(Bytes::from(encoded));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append query pairs to the URL
    pub fn query<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.url.query_pairs_mut().extend_pairs(pairs);
        self
    }

    /// Header value as a string, when present and valid
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

// ============================================================================
// Response
// ============================================================================

/// Response with a streamed body
pub struct HttpResponse {
    pub status: u16,
    body: ByteStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    /// Response with a fully buffered body
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(status, Box::pin(futures::stream::once(async move { Ok::<_, CouchError>(body) })))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collect the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        let buf = self
            .body
            .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await?;
        Ok(buf.freeze())
    }

    /// Decode the body as JSON
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let status = self.status;
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CouchError::decode_with_source(format!("Invalid JSON body (status {})", status), e)
        })
    }

    /// Read the body line by line
    pub fn into_lines(self) -> LineReader {
        LineReader::new(self.body)
    }

    /// Discard the rest of the body so the connection can be reused
    pub async fn drain(self) {
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            if chunk.is_err() {
                break;
            }
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Executes a single HTTP exchange; no retries, no session handling
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// `reqwest` backed transport with a cookie store for the session cookie
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(config.connect_timeout)
            .user_agent(CLIENT_USER_AGENT)
            .build()
            .map_err(|e| CouchError::transport_with_source("Failed to create HTTP client", e))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().await.map_err(|e| {
            CouchError::transport_with_source(
                format!("{} {} failed", request.method, request.url),
                e,
            )
        })?;

        let status = resp.status().as_u16();
        trace!(method = %request.method, url = %request.url, status, "Response received");

        let body = resp.bytes_stream().map_err(|e| {
            CouchError::transport_with_source("Failed reading response body", e)
        });
        Ok(HttpResponse::new(status, Box::pin(body)))
    }
}
