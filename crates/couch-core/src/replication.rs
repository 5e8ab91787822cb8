//! Replication checkpoint documents
//!
//! A replication log is stored as `_local/<replication id>` on both the source
//! and the sink. Comparing the two logs tells a new run where it can resume.

use crate::message::Seq;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version tag written into every replication log
pub const REPLICATION_ID_VERSION: u32 = 3;

/// One completed batch, as recorded in the log history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogHistoryRow {
    pub session_id: String,
    pub recorded_seq: Option<Seq>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub start_last_seq: Option<Seq>,
    #[serde(default)]
    pub end_last_seq: Option<Seq>,
    #[serde(default)]
    pub docs_read: u64,
    #[serde(default)]
    pub docs_written: u64,
    #[serde(default)]
    pub missing_checked: u64,
    #[serde(default)]
    pub missing_found: u64,
    #[serde(default)]
    pub doc_write_failures: u64,
}

/// `_local` replication checkpoint document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationLog {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default)]
    pub history: Vec<LogHistoryRow>,
    #[serde(default)]
    pub replication_id_version: u32,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub source_last_seq: Option<Seq>,
}

impl ReplicationLog {
    /// Empty log for a replication that has never checkpointed
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            replication_id_version: REPLICATION_ID_VERSION,
            ..Default::default()
        }
    }

    /// Find the sequence both sides agree on
    ///
    /// If both logs were last written by the same session, the recorded source
    /// position is returned. Otherwise the most recent history row of `self`
    /// whose session also appears in `other`'s history gives the resume point.
    /// Returns `None` when the logs share nothing and replication has to start
    /// from scratch. Empty session ids never match.
    pub fn find_common_ancestry(&self, other: &ReplicationLog) -> Option<Seq> {
        if !self.session_id.is_empty() && self.session_id == other.session_id {
            return self.source_last_seq.clone();
        }

        self.history
            .iter()
            .filter(|row| !row.session_id.is_empty())
            .find(|row| {
                other
                    .history
                    .iter()
                    .any(|theirs| theirs.session_id == row.session_id)
            })
            .and_then(|row| row.recorded_seq.clone())
    }

    /// Prepend a history row and advance the log to it
    pub fn record(&mut self, row: LogHistoryRow) {
        self.session_id = row.session_id.clone();
        self.source_last_seq = row.recorded_seq.clone();
        self.replication_id_version = REPLICATION_ID_VERSION;
        self.history.insert(0, row);
    }
}
