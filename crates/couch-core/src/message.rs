//! Wire types for couch-sync
//!
//! Defines the changes-feed rows, the parsed change events handed to callers,
//! and the request/response bodies of the bulk, revs-diff and bulk-get endpoints.

use crate::error::CouchError;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Prefix every document row of a continuous changes feed starts with
pub const CHANGE_ROW_MARKER: &str = "{\"seq\":";

// ============================================================================
// Sequence tokens
// ============================================================================

/// Opaque changes-feed sequence token
///
/// Older servers send integers, newer ones send strings; both are normalized to
/// the string form. Tokens are only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Seq(String);

impl Seq {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Seq {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for Seq {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl Serialize for Seq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Seq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SeqVisitor)
    }
}

struct SeqVisitor;

impl<'de> Visitor<'de> for SeqVisitor {
    type Value = Seq;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sequence token as string or integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Seq, E> {
        Ok(Seq::new(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Seq, E> {
        Ok(Seq(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Seq, E> {
        Ok(Seq(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Seq, E> {
        Ok(Seq(v.to_string()))
    }
}

/// Deserialize an optional sequence, mapping JSON `null` (sent between
/// `seq_interval` boundaries) to `None`
fn optional_seq<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Seq>, D::Error> {
    Option::<Seq>::deserialize(deserializer)
}

// ============================================================================
// Changes feed
// ============================================================================

/// Document id/revision pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub rev: String,
}

impl DocumentMeta {
    pub fn new(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: rev.into(),
        }
    }
}

/// Revision entry of a changes row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionRef {
    pub rev: String,
}

/// One raw row of the changes feed
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRow {
    #[serde(default, deserialize_with = "optional_seq")]
    pub seq: Option<Seq>,
    pub id: String,
    pub changes: Vec<RevisionRef>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Value>,
}

/// Event kind, mostly useful for logging and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Heartbeat,
    Terminated,
    Error,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Heartbeat => "heartbeat",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document change carried by insert/update/delete events
#[derive(Debug, Clone)]
pub struct DocChange {
    pub meta: DocumentMeta,
    pub seq: Option<Seq>,
    pub doc: Option<Value>,
}

/// Parsed changes-feed event
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// First revision (`1-...`) of a document
    Insert(DocChange),
    /// Later revision of a document
    Update(DocChange),
    /// Document deletion
    Delete(DocChange),
    /// Empty keep-alive line
    Heartbeat,
    /// The server closed the feed or the read failed
    Terminated,
    /// A row could not be decoded; the feed continues
    Error(CouchError),
}

impl ChangeEvent {
    /// Classify a raw row
    ///
    /// Deleted rows are deletes; a first revision starting with `1-` is an
    /// insert; anything else is an update. The revision heuristic is lossy: a
    /// follower that resumes after a document's first revision was superseded
    /// reports the creation as an update.
    pub fn from_row(row: ChangeRow) -> Self {
        let Some(first) = row.changes.into_iter().next() else {
            return Self::Error(CouchError::decode(format!(
                "change row for {} carries no revision",
                row.id
            )));
        };

        let insert = first.rev.starts_with("1-");
        let change = DocChange {
            meta: DocumentMeta::new(row.id, first.rev),
            seq: row.seq,
            doc: row.doc,
        };

        if row.deleted {
            Self::Delete(change)
        } else if insert {
            Self::Insert(change)
        } else {
            Self::Update(change)
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
            Self::Heartbeat => ChangeKind::Heartbeat,
            Self::Terminated => ChangeKind::Terminated,
            Self::Error(_) => ChangeKind::Error,
        }
    }

    /// Document change, for insert/update/delete events
    pub fn change(&self) -> Option<&DocChange> {
        match self {
            Self::Insert(c) | Self::Update(c) | Self::Delete(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_change(self) -> Option<DocChange> {
        match self {
            Self::Insert(c) | Self::Update(c) | Self::Delete(c) => Some(c),
            _ => None,
        }
    }

    /// Sequence token of the event, if the feed supplied one
    pub fn seq(&self) -> Option<&Seq> {
        self.change().and_then(|c| c.seq.as_ref())
    }
}

// ============================================================================
// Bulk documents
// ============================================================================

/// Per-document result of a `_bulk_docs` write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocResult {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DocResult {
    /// Convert into the caller-facing result, turning server-side rejections
    /// (conflicts, validation failures) into errors
    pub fn into_result(self) -> Result<DocResult, CouchError> {
        match self.error {
            Some(error) => Err(CouchError::Document {
                id: self.id,
                error,
                reason: self.reason.unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

// ============================================================================
// Revs diff / bulk get
// ============================================================================

/// `_revs_diff` request body: document id to candidate revisions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffRequest(BTreeMap<String, Vec<String>>);

impl RevsDiffRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an id/revision pair
    pub fn add(&mut self, id: impl Into<String>, rev: impl Into<String>) {
        self.0.entry(id.into()).or_default().push(rev.into());
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Missing revisions for one document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<String>,
}

/// `_revs_diff` response: document id to missing revisions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffResponse(pub BTreeMap<String, RevsDiffEntry>);

impl RevsDiffResponse {
    /// Flatten into id/revision pairs
    pub fn missing(&self) -> impl Iterator<Item = DocumentMeta> + '_ {
        self.0.iter().flat_map(|(id, entry)| {
            entry
                .missing
                .iter()
                .map(move |rev| DocumentMeta::new(id.clone(), rev.clone()))
        })
    }

    pub fn missing_count(&self) -> usize {
        self.0.values().map(|e| e.missing.len()).sum()
    }
}

/// `_bulk_get` request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkGetRequest {
    pub docs: Vec<DocumentMeta>,
}

impl BulkGetRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<String>, rev: impl Into<String>) {
        self.docs.push(DocumentMeta::new(id, rev));
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl FromIterator<DocumentMeta> for BulkGetRequest {
    fn from_iter<T: IntoIterator<Item = DocumentMeta>>(iter: T) -> Self {
        Self {
            docs: iter.into_iter().collect(),
        }
    }
}

/// One revision of a `_bulk_get` result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkGetDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BulkGetError>,
}

/// A revision the source could not return
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkGetError {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub rev: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

impl From<&BulkGetError> for CouchError {
    fn from(err: &BulkGetError) -> Self {
        CouchError::Document {
            id: err.id.clone(),
            error: err.error.clone(),
            reason: err.reason.clone(),
        }
    }
}

/// Results for one requested document id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkGetResult {
    pub id: String,
    #[serde(default)]
    pub docs: Vec<BulkGetDoc>,
}

/// `_bulk_get` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkGetResponse {
    #[serde(default)]
    pub results: Vec<BulkGetResult>,
}

impl BulkGetResponse {
    /// Successfully fetched document bodies, in response order
    pub fn documents(&self) -> impl Iterator<Item = &Value> {
        self.results
            .iter()
            .flat_map(|r| r.docs.iter())
            .filter_map(|d| d.ok.as_ref())
    }

    /// Revisions that could not be fetched; a missing `id` falls back to the result's
    pub fn errors(&self) -> impl Iterator<Item = BulkGetError> + '_ {
        self.results.iter().flat_map(|r| {
            r.docs.iter().filter_map(move |d| {
                d.error.as_ref().map(|err| BulkGetError {
                    id: if err.id.is_empty() { r.id.clone() } else { err.id.clone() },
                    ..err.clone()
                })
            })
        })
    }
}

/// CouchDB error body, `{"error": ..., "reason": ...}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_and_string_seq_normalize() {
        let numeric: ChangeRow =
            serde_json::from_str(r#"{"seq":59,"id":"X","changes":[{"rev":"1-abc"}]}"#).unwrap();
        let string: ChangeRow =
            serde_json::from_str(r#"{"seq":"59","id":"X","changes":[{"rev":"1-abc"}]}"#).unwrap();

        assert_eq!(numeric.seq, Some(Seq::from("59")));
        assert_eq!(string.seq, Some(Seq::from("59")));
    }

    #[test]
    fn test_null_seq_is_none() {
        let row: ChangeRow =
            serde_json::from_str(r#"{"seq":null,"id":"X","changes":[{"rev":"2-abc"}]}"#).unwrap();
        assert!(row.seq.is_none());
    }

    #[test]
    fn test_event_classification() {
        let row = |rev: &str, deleted: bool| ChangeRow {
            seq: Some(Seq::from("1")),
            id: "doc".to_string(),
            changes: vec![RevisionRef { rev: rev.to_string() }],
            deleted,
            doc: None,
        };

        assert_eq!(ChangeEvent::from_row(row("1-a", false)).kind(), ChangeKind::Insert);
        assert_eq!(ChangeEvent::from_row(row("2-a", false)).kind(), ChangeKind::Update);
        assert_eq!(ChangeEvent::from_row(row("3-a", true)).kind(), ChangeKind::Delete);
        // deletion wins over the first-revision heuristic
        assert_eq!(ChangeEvent::from_row(row("1-a", true)).kind(), ChangeKind::Delete);
    }

    #[test]
    fn test_row_without_revisions_is_error() {
        let row: ChangeRow = serde_json::from_str(r#"{"seq":"1","id":"X","changes":[]}"#).unwrap();
        assert_eq!(ChangeEvent::from_row(row).kind(), ChangeKind::Error);
    }

    #[test]
    fn test_doc_result_conflict() {
        let result: DocResult = serde_json::from_value(json!({
            "id": "doc-1",
            "error": "conflict",
            "reason": "Document update conflict."
        }))
        .unwrap();

        let err = result.into_result().unwrap_err();
        assert_eq!(err.to_string(), "conflict - Document update conflict.");
    }

    #[test]
    fn test_revs_diff_request_groups_by_id() {
        let mut req = RevsDiffRequest::new();
        req.add("a", "1-x");
        req.add("a", "2-y");
        req.add("b", "1-z");

        assert_eq!(req.len(), 3);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"a": ["1-x", "2-y"], "b": ["1-z"]})
        );
    }

    #[test]
    fn test_revs_diff_response_flattens_missing() {
        let resp: RevsDiffResponse = serde_json::from_value(json!({
            "a": {"missing": ["2-y"]},
            "b": {"missing": ["1-z", "2-w"], "possible_ancestors": ["1-q"]}
        }))
        .unwrap();

        let missing: Vec<_> = resp.missing().collect();
        assert_eq!(resp.missing_count(), 3);
        assert_eq!(missing[0], DocumentMeta::new("a", "2-y"));
    }

    #[test]
    fn test_bulk_get_documents_and_errors() {
        let resp: BulkGetResponse = serde_json::from_value(json!({
            "results": [
                {"id": "a", "docs": [{"ok": {"_id": "a", "_rev": "2-y"}}]},
                {"id": "b", "docs": [{"error": {"id": "b", "rev": "3-z", "error": "not_found", "reason": "missing"}}]},
                {"id": "c", "docs": [{"error": {"error": "forbidden"}}]}
            ]
        }))
        .unwrap();

        let docs: Vec<_> = resp.documents().collect();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["_id"], "a");

        let errors: Vec<_> = resp.errors().collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].rev, "3-z");
        assert_eq!(CouchError::from(&errors[0]).to_string(), "not_found - missing");
        assert_eq!(errors[1].id, "c");
    }
}
