//! # couch-follower
//!
//! Follows `_changes?feed=continuous` and yields typed change events.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut follower = Follower::new(db, FollowerConfig::default())
//!     .with_since(checkpoint.load().await?);
//! let mut changes = follower.follow().await?;
//!
//! while let Some(event) = changes.next().await {
//!     if let Some(seq) = event.seq() {
//!         checkpoint.save(seq).await?;
//!     }
//! }
//! follower.close().await;
//! ```

pub mod checkpoint;
pub mod follower;

pub use checkpoint::{CheckpointStore, FileCheckpoint, MemoryCheckpoint};
pub use follower::{parse_line, ChangeStream, Follower};
