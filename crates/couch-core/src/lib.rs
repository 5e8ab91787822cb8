//! # couch-core
//!
//! Shared types for the couch-sync workspace: the error taxonomy, the wire
//! types of the changes, bulk, revs-diff and bulk-get endpoints, replication
//! logs, configuration, metrics and the observer interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Follower   │────►│  Replicator  │────►│   Uploader   │
//! │  (_changes)  │     │ (diff/fetch) │     │ (_bulk_docs) │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!        │                    │                    │
//!        └────────────► ┌─────┴──────┐ ◄───────────┘
//!                       │ CouchClient│
//!                       │ worker pool│
//!                       └────────────┘
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod observer;
pub mod replication;

pub use self::config::*;
pub use self::error::*;
pub use self::message::*;
pub use self::metrics::*;
pub use self::observer::*;
pub use self::replication::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::CouchConfig;
    pub use crate::error::{CouchError, Result};
    pub use crate::message::{ChangeEvent, DocResult, DocumentMeta, Seq};
    pub use crate::observer::{Event, Observer, SharedObserver};
    pub use crate::replication::ReplicationLog;
}
