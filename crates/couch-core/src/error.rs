//! Error types for couch-sync
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.
//! Errors are `Clone` so that a single batch-level failure can be delivered to
//! every document job that belonged to the batch.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for couch-sync operations
pub type Result<T> = std::result::Result<T, CouchError>;

/// Shared, clonable error source
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Primary error type for all couch-sync operations
#[derive(Error, Debug, Clone)]
pub enum CouchError {
    /// Connection, DNS, TLS or timeout failure below the HTTP layer
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// The server answered with a CouchDB error body
    #[error("{status}: {{{error}, {reason}}}")]
    Http {
        status: u16,
        error: String,
        reason: String,
    },

    /// The server answered with a status the caller did not expect and no error body
    #[error("Unexpected status {status}")]
    UnexpectedStatus { status: u16 },

    /// Request body serialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// Response body could not be decoded
    #[error("Decode error: {message}")]
    Decode {
        message: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// A single document in a bulk write was rejected by the server
    #[error("{error} - {reason}")]
    Document {
        id: String,
        error: String,
        reason: String,
    },

    /// A bulk batch exceeded the configured byte limit and was never sent
    #[error("Batch of {size} bytes exceeds the maximum of {max} bytes")]
    BatchTooLarge { size: usize, max: usize },

    /// Session creation failed
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Checkpoint/resume errors
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// Operation not valid in the component's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The pool, uploader or follower has been stopped
    #[error("Shutdown requested")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CouchError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a serialization error with source
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
            source: None,
        }
    }

    /// Create a decode error with source
    pub fn decode_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Decode {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    /// Create a checkpoint error with source
    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::UnexpectedStatus { status } => Some(*status),
            _ => None,
        }
    }

    /// Check if error is retryable
    ///
    /// Transport failures, rate limiting and server-side failures are retried
    /// by the worker pool; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            _ => self.status().is_some_and(is_retryable_status),
        }
    }
}

impl From<serde_json::Error> for CouchError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("JSON encoding failed", err)
    }
}

impl From<url::ParseError> for CouchError {
    fn from(err: url::ParseError) -> Self {
        Self::config(format!("Invalid URL: {}", err))
    }
}

/// Statuses the pool retries: rate limiting and server-side failures
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 501 | 502 | 503 | 504)
}

/// Statuses that indicate an expired or missing session
pub fn is_auth_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}
