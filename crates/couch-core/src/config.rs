//! Configuration types for couch-sync
//!
//! Uses the `config` crate for layered configuration from files and environment.

use crate::error::{CouchError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CouchConfig {
    /// HTTP client and worker pool configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Bulk uploader configuration
    #[serde(default)]
    pub bulk: BulkConfig,

    /// Changes follower configuration
    #[serde(default)]
    pub follower: FollowerConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Server connection and worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server root URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Optional username for session authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password for session authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Number of pool workers executing requests
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Request timeout (the changes feed is exempt)
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_url() -> String {
    "http://localhost:5984".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            workers: default_workers(),
            retry: RetryConfig::default(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    /// Client configuration for a server URL with defaults elsewhere
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set session credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parsed server root URL, always ending in `/`
    pub fn root_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Credentials, when both parts are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Lower bound of the random delay before a retry
    #[serde(with = "humantime_serde", default = "default_delay_min")]
    pub delay_min: Duration,

    /// Upper bound of the random delay before a retry
    #[serde(with = "humantime_serde", default = "default_delay_max")]
    pub delay_max: Duration,
}

fn default_max_retries() -> u32 {
    3
}

fn default_delay_min() -> Duration {
    Duration::from_secs(5)
}

fn default_delay_max() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_min: default_delay_min(),
            delay_max: default_delay_max(),
        }
    }
}

// ============================================================================
// Component Configurations
// ============================================================================

/// Bulk uploader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Maximum documents per `_bulk_docs` request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum serialized bytes per request, framing included
    #[serde(default = "default_max_bytes")]
    pub max_bytes: Option<usize>,

    /// Optional periodic flush
    #[serde(with = "humantime_serde", default)]
    pub flush_interval: Option<Duration>,

    /// `false` preserves the revisions of uploaded documents (`new_edits=false`)
    #[serde(default = "default_true")]
    pub new_edits: bool,

    /// Number of bulk workers, each with its own batch
    #[serde(default = "default_bulk_concurrency")]
    pub concurrency: usize,
}

fn default_batch_size() -> usize {
    500
}

fn default_max_bytes() -> Option<usize> {
    Some(1024 * 1024) // 1MiB
}

fn default_true() -> bool {
    true
}

fn default_bulk_concurrency() -> usize {
    4
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_bytes: default_max_bytes(),
            flush_interval: None,
            new_edits: true,
            concurrency: default_bulk_concurrency(),
        }
    }
}

/// Changes follower configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerConfig {
    /// Server heartbeat interval
    #[serde(with = "humantime_serde", default = "default_heartbeat")]
    pub heartbeat: Duration,

    /// Server-side feed timeout
    #[serde(with = "humantime_serde", default = "default_feed_timeout")]
    pub timeout: Duration,

    /// Include document bodies in change rows
    #[serde(default = "default_true")]
    pub include_docs: bool,

    /// Only compute sequence tokens every N rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_interval: Option<u64>,
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(10)
}

fn default_feed_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            heartbeat: default_heartbeat(),
            timeout: default_feed_timeout(),
            include_docs: true,
            seq_interval: None,
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Changes per replication batch
    #[serde(default = "default_replication_batch_size")]
    pub batch_size: usize,

    /// Batches processed concurrently
    #[serde(default = "default_replication_concurrency")]
    pub concurrency: usize,
}

fn default_replication_batch_size() -> usize {
    100
}

fn default_replication_concurrency() -> usize {
    4
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_replication_batch_size(),
            concurrency: default_replication_concurrency(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl CouchConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // COUCH_SYNC__CLIENT__URL, COUCH_SYNC__BULK__BATCH_SIZE, ...
        builder = builder.add_source(
            config::Environment::with_prefix("COUCH_SYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        self.client.root_url()?;

        if self.client.workers == 0 {
            return Err(CouchError::config("client.workers must be at least 1"));
        }
        if self.client.retry.delay_min > self.client.retry.delay_max {
            return Err(CouchError::config(
                "client.retry.delay_min must not exceed client.retry.delay_max",
            ));
        }
        if self.bulk.batch_size == 0 || self.bulk.concurrency == 0 {
            return Err(CouchError::config(
                "bulk.batch_size and bulk.concurrency must be at least 1",
            ));
        }
        if self.replication.batch_size == 0 || self.replication.concurrency == 0 {
            return Err(CouchError::config(
                "replication.batch_size and replication.concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}
