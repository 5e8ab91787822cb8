//! Cookie session authentication

use crate::transport::{HttpRequest, Transport};
use couch_core::error::{CouchError, Result};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Credentials plus the `_session` endpoint they are posted to
#[derive(Clone)]
pub struct Session {
    url: Url,
    username: String,
    password: String,
    timeout: Duration,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        root: &Url,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            url: root.join("_session")?,
            username: username.into(),
            password: password.into(),
            timeout,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `POST /_session` with the credentials as a form
    pub fn login_request(&self) -> HttpRequest {
        HttpRequest::post(self.url.clone())
            .form([
                ("name", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .timeout(Some(self.timeout))
    }

    /// `DELETE /_session`
    pub fn logout_request(&self) -> HttpRequest {
        HttpRequest::delete(self.url.clone()).timeout(Some(self.timeout))
    }

    /// Log in again directly on the transport
    ///
    /// Used by a worker that hit 401/403; it does not go through the queue, so
    /// it cannot deadlock a pool whose workers are all busy.
    pub async fn renew(&self, transport: &dyn Transport) -> Result<()> {
        let resp = transport.send(&self.login_request()).await?;
        let status = resp.status;
        resp.drain().await;
        check_login_status(status)
    }
}

/// Map a login response status to the outcome
pub(crate) fn check_login_status(status: u16) -> Result<()> {
    if status == 200 {
        Ok(())
    } else {
        Err(CouchError::Authentication {
            message: format!("login returned status {}", status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockReply, MockTransport};

    fn session() -> Session {
        let root = Url::parse("http://localhost:5984/").unwrap();
        Session::new(&root, "admin", "secret", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_login_request_is_form() {
        let req = session().login_request();
        assert_eq!(req.url.path(), "/_session");
        assert_eq!(req.method, reqwest::Method::POST);
        assert_eq!(
            req.body.unwrap(),
            bytes::Bytes::from("name=admin&password=secret")
        );
    }

    #[test]
    fn test_debug_hides_password() {
        assert!(!format!("{:?}", session()).contains("secret"));
    }

    #[tokio::test]
    async fn test_renew_rejected() {
        let mock = MockTransport::always(MockReply::status(401));
        let err = session().renew(&*mock).await.unwrap_err();
        assert!(matches!(err, CouchError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_renew_ok() {
        let mock = MockTransport::always(MockReply::json(200, &serde_json::json!({"ok": true})));
        session().renew(&*mock).await.unwrap();
        assert_eq!(mock.request_count(), 1);
    }
}
