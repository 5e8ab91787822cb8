//! # couch-client
//!
//! HTTP client for CouchDB-compatible servers. Requests are executed by a
//! bounded pool of workers that retry transient failures with a random delay
//! and renew the cookie session on 401/403.

pub mod client;
pub mod database;
pub mod job;
pub mod lines;
pub mod mock;
pub mod pool;
pub mod retry;
pub mod session;
pub mod transport;

pub use client::{expect_status, CouchClient};
pub use database::Database;
pub use job::{CompletedJob, Job, JobHandle};
pub use lines::LineReader;
pub use pool::Pool;
pub use retry::RetryPolicy;
pub use session::Session;
pub use transport::{ByteStream, HttpRequest, HttpResponse, ReqwestTransport, Transport};
