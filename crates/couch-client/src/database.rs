//! Per-database endpoints
//!
//! Requests stay thin: a method, a URL built from path segments and query
//! pairs, and an optional JSON body. Everything goes through the pool.

use crate::client::{expect_status, CouchClient};
use crate::transport::HttpRequest;
use couch_core::error::{CouchError, Result};
use couch_core::message::{BulkGetRequest, BulkGetResponse, RevsDiffRequest, RevsDiffResponse};
use couch_core::replication::{LogHistoryRow, ReplicationLog};
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

#[derive(Debug, Deserialize)]
struct PutResponse {
    #[serde(default)]
    rev: Option<String>,
}

/// A named database on a server
#[derive(Clone)]
pub struct Database {
    client: CouchClient,
    name: String,
    url: Url,
}

impl Database {
    pub(crate) fn new(client: CouchClient, name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(CouchError::config("database name must not be empty"));
        }

        let mut url = client.root().clone();
        url.path_segments_mut()
            .map_err(|_| CouchError::config("server URL cannot hold a path"))?
            .pop_if_empty()
            .push(name)
            .push("");

        Ok(Self {
            client,
            name: name.to_string(),
            url,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database URL, ending in `/`
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn client(&self) -> &CouchClient {
        &self.client
    }

    /// URL of a path below the database; each segment is percent-encoded
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| CouchError::config("database URL cannot hold a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `PUT /{db}`; returns `false` if it already existed
    pub async fn create(&self) -> Result<bool> {
        let req = self.client.request(Method::PUT, self.url.clone());
        let resp = expect_status(self.client.execute(req).await?, &[201, 202, 412]).await?;
        let created = resp.status != 412;
        resp.drain().await;

        debug!(db = %self.name, created, "Database ensured");
        Ok(created)
    }

    /// `DELETE /{db}`
    pub async fn delete(&self) -> Result<()> {
        let req = self.client.request(Method::DELETE, self.url.clone());
        expect_status(self.client.execute(req).await?, &[200, 202])
            .await?
            .drain()
            .await;
        Ok(())
    }

    /// `POST /{db}/_revs_diff`
    pub async fn revs_diff(&self, request: &RevsDiffRequest) -> Result<RevsDiffResponse> {
        let req = self
            .client
            .request(Method::POST, self.endpoint(&["_revs_diff"])?)
            .json(request)?;
        let resp = expect_status(self.client.execute(req).await?, &[200]).await?;
        let diff: RevsDiffResponse = resp.json().await?;

        trace!(db = %self.name, checked = request.len(), missing = diff.missing_count(), "Revs diff");
        Ok(diff)
    }

    /// `POST /{db}/_bulk_get?revs=true`
    pub async fn bulk_get(&self, request: &BulkGetRequest) -> Result<BulkGetResponse> {
        let req = self
            .client
            .request(Method::POST, self.endpoint(&["_bulk_get"])?)
            .query([("revs", "true")])
            .json(request)?;
        let resp = expect_status(self.client.execute(req).await?, &[200]).await?;
        resp.json().await
    }

    /// `_bulk_docs` endpoint
    pub fn bulk_docs_url(&self) -> Result<Url> {
        self.endpoint(&["_bulk_docs"])
    }

    /// Continuous changes request; carries no overall timeout
    pub fn changes_request<'a>(
        &self,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<HttpRequest> {
        Ok(HttpRequest::get(self.endpoint(&["_changes"])?).query(params))
    }

    /// `GET /{db}/_local/{id}`; `None` when no log exists yet
    pub async fn replication_log(&self, id: &str) -> Result<Option<ReplicationLog>> {
        let req = self
            .client
            .request(Method::GET, self.endpoint(&["_local", id])?);
        let resp = self.client.execute(req).await?;
        if resp.status == 404 {
            resp.drain().await;
            return Ok(None);
        }
        let resp = expect_status(resp, &[200]).await?;
        Ok(Some(resp.json().await?))
    }

    /// Append `row` to the `_local/{id}` log
    ///
    /// Read-modify-write: concurrent writers of the same log can race, and the
    /// loser gets a 409.
    pub async fn write_replication_log(&self, id: &str, row: LogHistoryRow) -> Result<ReplicationLog> {
        let mut log = self
            .replication_log(id)
            .await?
            .unwrap_or_else(|| ReplicationLog::empty(format!("_local/{}", id)));
        log.record(row);

        let req = self
            .client
            .request(Method::PUT, self.endpoint(&["_local", id])?)
            .json(&log)?;
        let resp = expect_status(self.client.execute(req).await?, &[200, 201]).await?;
        let put: PutResponse = resp.json().await?;
        if put.rev.is_some() {
            log.rev = put.rev;
        }

        debug!(db = %self.name, id, "Replication log written");
        Ok(log)
    }
}
