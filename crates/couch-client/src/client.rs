//! Client facade over the worker pool

use crate::database::Database;
use crate::job::{Job, JobHandle};
use crate::pool::Pool;
use crate::retry::RetryPolicy;
use crate::session::{check_login_status, Session};
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use couch_core::config::ClientConfig;
use couch_core::error::{CouchError, Result};
use couch_core::message::ErrorBody;
use couch_core::observer::{SharedObserver, TracingObserver};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

struct ClientInner {
    root: Url,
    pool: Pool,
    session: Option<Session>,
    request_timeout: Duration,
    observer: SharedObserver,
}

/// Handle to one server; cheap to clone
#[derive(Clone)]
pub struct CouchClient {
    inner: Arc<ClientInner>,
}

impl CouchClient {
    /// Connect over HTTP and log in when credentials are configured
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config)?);
        let client = Self::with_transport(config, transport, TracingObserver::shared("couch-client"))?;

        if client.inner.session.is_some() {
            client.log_in().await?;
        }

        info!(url = %client.inner.root, "Connected");
        Ok(client)
    }

    /// Build a client over any transport without logging in
    ///
    /// Must be called inside a tokio runtime; the worker pool starts immediately.
    pub fn with_transport(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        observer: SharedObserver,
    ) -> Result<Self> {
        let root = config.root_url()?;
        let session = match config.credentials() {
            Some((username, password)) => Some(Session::new(
                &root,
                username,
                password,
                config.request_timeout,
            )?),
            None => None,
        };

        let pool = Pool::start(
            transport,
            session.clone(),
            config.workers,
            RetryPolicy::from(&config.retry),
            observer.clone(),
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                root,
                pool,
                session,
                request_timeout: config.request_timeout,
                observer,
            }),
        })
    }

    /// Server root URL, ending in `/`
    pub fn root(&self) -> &Url {
        &self.inner.root
    }

    pub fn observer(&self) -> SharedObserver {
        self.inner.observer.clone()
    }

    /// Resolve `path` against the server root
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self.inner.root.join(path)?)
    }

    /// Request to `url` with the configured request timeout
    pub fn request(&self, method: Method, url: Url) -> HttpRequest {
        HttpRequest::new(method, url).timeout(Some(self.inner.request_timeout))
    }

    /// Queue a request on the pool
    pub async fn submit(&self, request: HttpRequest) -> JobHandle {
        let (job, handle) = Job::new(request);
        self.inner.pool.submit(job).await;
        handle
    }

    /// Submit and wait for the final response
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.submit(request).await.wait().await.into_response()
    }

    /// Create a session through the pool
    pub async fn log_in(&self) -> Result<()> {
        let session = self
            .inner
            .session
            .as_ref()
            .ok_or_else(|| CouchError::config("no credentials configured"))?;

        let (job, handle) = Job::login(session.login_request());
        self.inner.pool.submit(job).await;
        let resp = handle.wait().await.into_response()?;
        let status = resp.status;
        resp.drain().await;
        check_login_status(status)?;

        debug!(user = session.username(), "Logged in");
        Ok(())
    }

    /// Delete the current session
    pub async fn log_out(&self) -> Result<()> {
        let session = self
            .inner
            .session
            .as_ref()
            .ok_or_else(|| CouchError::config("no credentials configured"))?;

        let resp = self.execute(session.logout_request()).await?;
        expect_status(resp, &[200]).await?.drain().await;
        Ok(())
    }

    /// `HEAD /`
    pub async fn ping(&self) -> Result<()> {
        let req = self.request(Method::HEAD, self.inner.root.clone());
        let resp = self.execute(req).await?;
        expect_status(resp, &[200]).await?.drain().await;
        Ok(())
    }

    /// Handle to a database on this server
    pub fn database(&self, name: &str) -> Result<Database> {
        Database::new(self.clone(), name)
    }

    /// Stop the worker pool; later requests fail with a shutdown error
    pub async fn stop(&self) {
        self.inner.pool.stop().await;
    }
}

/// Pass `resp` through when its status is accepted
///
/// Otherwise the body is read for a CouchDB error document and turned into
/// [`CouchError::Http`], or [`CouchError::UnexpectedStatus`] without one.
pub async fn expect_status(resp: HttpResponse, accepted: &[u16]) -> Result<HttpResponse> {
    if accepted.contains(&resp.status) {
        return Ok(resp);
    }

    let status = resp.status;
    let body = resp.bytes().await.unwrap_or_default();
    match serde_json::from_slice::<ErrorBody>(&body) {
        Ok(err) if !err.error.is_empty() => Err(CouchError::Http {
            status,
            error: err.error,
            reason: err.reason,
        }),
        _ => Err(CouchError::UnexpectedStatus { status }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockReply, MockTransport};
    use couch_core::observer::RecordingObserver;
    use serde_json::json;

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new("http://mock:5984");
        config.retry.delay_min = Duration::from_millis(1);
        config.retry.delay_max = Duration::from_millis(2);
        config
    }

    #[tokio::test]
    async fn test_expect_status_decodes_error_body() {
        let resp = HttpResponse::from_bytes(
            404,
            r#"{"error":"not_found","reason":"Database does not exist."}"#,
        );
        let err = expect_status(resp, &[200]).await.unwrap_err();
        assert_eq!(err.to_string(), "404: {not_found, Database does not exist.}");
    }

    #[tokio::test]
    async fn test_expect_status_without_body() {
        let err = expect_status(HttpResponse::from_bytes(418, ""), &[200])
            .await
            .unwrap_err();
        assert!(matches!(err, CouchError::UnexpectedStatus { status: 418 }));
    }

    #[tokio::test]
    async fn test_log_in_posts_form() {
        let mock = MockTransport::always(MockReply::json(200, &json!({"ok": true})));
        let client = CouchClient::with_transport(
            &config().with_credentials("admin", "pw"),
            mock.clone(),
            RecordingObserver::new(),
        )
        .unwrap();

        client.log_in().await.unwrap();

        let seen = mock.requests();
        assert_eq!(seen[0].path(), "/_session");
        assert_eq!(seen[0].body_str().as_deref(), Some("name=admin&password=pw"));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_log_in_rejected_is_not_retried() {
        let mock = MockTransport::always(MockReply::status(401));
        let client = CouchClient::with_transport(
            &config().with_credentials("admin", "bad"),
            mock.clone(),
            RecordingObserver::new(),
        )
        .unwrap();

        let err = client.log_in().await.unwrap_err();
        assert!(matches!(err, CouchError::Authentication { .. }));
        assert_eq!(mock.request_count(), 1);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_log_in_without_credentials() {
        let mock = MockTransport::always(MockReply::status(200));
        let client = CouchClient::with_transport(&config(), mock, RecordingObserver::new()).unwrap();

        assert!(matches!(
            client.log_in().await,
            Err(CouchError::Configuration { .. })
        ));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_ping() {
        let mock = MockTransport::always(MockReply::status(200));
        let client = CouchClient::with_transport(&config(), mock.clone(), RecordingObserver::new()).unwrap();

        client.ping().await.unwrap();
        assert_eq!(mock.requests()[0].method(), "HEAD");
        client.stop().await;
    }
}
