//! # couch-bulk
//!
//! Batching `_bulk_docs` uploader.
//!
//! ## Flush policy
//!
//! For every document a worker receives:
//! 1. if adding it would exceed `batch_size` documents or `max_bytes` bytes,
//!    the current batch is flushed first;
//! 2. the document is added;
//! 3. a priority document (`upload_now`) or a full batch flushes immediately.
//!
//! Explicit `flush()`/`async_flush()` calls and the optional periodic timer
//! flush whatever is pending.

mod batch;
pub mod job;
pub mod uploader;

pub use job::{BulkJob, DocOutcome};
pub use uploader::Uploader;
