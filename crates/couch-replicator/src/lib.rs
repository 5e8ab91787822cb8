//! # couch-replicator
//!
//! One-way replication from a source database to a sink database.
//!
//! ## Protocol
//!
//! 1. Both sides' `_local/<replication id>` logs are compared to find a
//!    common checkpoint.
//! 2. The source changes feed is followed from that checkpoint.
//! 3. Each batch of changes is diffed against the sink (`_revs_diff`), the
//!    missing revisions are fetched from the source (`_bulk_get?revs=true`)
//!    and written to the sink with `new_edits=false`.
//! 4. A history row is appended to both logs after every batch.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut run = Replicator::new(source, sink, ReplicationConfig::default())
//!     .start()
//!     .await?;
//! if let Some(mut errors) = run.take_errors() {
//!     tokio::spawn(async move {
//!         while let Some(err) = errors.recv().await {
//!             eprintln!("{}", err);
//!         }
//!     });
//! }
//! let stats = run.finish().await?;
//! ```

mod batch;
mod checkpoint;
pub mod event;
pub mod replicator;

pub use event::{ReplicationError, ReplicationEvent, ReplicationStage, ReplicationStats};
pub use replicator::{replication_id, Replication, Replicator};
