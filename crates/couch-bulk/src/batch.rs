//! Batch accumulator for one bulk worker

use crate::job::{Completion, PendingDoc};
use bytes::{BufMut, Bytes, BytesMut};

const PREFIX: &[u8] = b"{\"docs\":[";
const SUFFIX: &[u8] = b"]}";
const SUFFIX_PRESERVE: &[u8] = b"],\"new_edits\":false}";

/// Serialized documents plus the jobs waiting on them, in submission order
#[derive(Debug)]
pub(crate) struct Batch {
    docs: BytesMut,
    pending: Vec<Completion>,
    new_edits: bool,
}

impl Batch {
    pub(crate) fn new(new_edits: bool) -> Self {
        Self {
            docs: BytesMut::new(),
            pending: Vec::new(),
            new_edits,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn suffix(&self) -> &'static [u8] {
        if self.new_edits {
            SUFFIX
        } else {
            SUFFIX_PRESERVE
        }
    }

    /// Size of the request body the batch would produce now
    pub(crate) fn encoded_len(&self) -> usize {
        PREFIX.len() + self.docs.len() + self.suffix().len()
    }

    /// Size of the request body after adding a document of `doc_len` bytes
    pub(crate) fn encoded_len_with(&self, doc_len: usize) -> usize {
        let separator = usize::from(!self.is_empty());
        self.encoded_len() + separator + doc_len
    }

    /// Whether the current batch must be flushed before `doc_len` more bytes
    /// can be added. An empty batch always accepts.
    pub(crate) fn would_overflow(&self, doc_len: usize, batch_size: usize, max_bytes: Option<usize>) -> bool {
        if self.is_empty() {
            return false;
        }
        self.len() >= batch_size || max_bytes.is_some_and(|max| self.encoded_len_with(doc_len) > max)
    }

    /// Append a document; returns whether it asked for an immediate flush
    pub(crate) fn push(&mut self, doc: PendingDoc) -> bool {
        if !self.is_empty() {
            self.docs.put_u8(b',');
        }
        self.docs.extend_from_slice(&doc.body);
        self.pending.push(doc.done);
        doc.priority
    }

    /// Take the framed body and the pending jobs, leaving the batch empty
    pub(crate) fn take(&mut self) -> (Bytes, Vec<Completion>) {
        let mut body = BytesMut::with_capacity(self.encoded_len());
        body.extend_from_slice(PREFIX);
        body.extend_from_slice(&self.docs);
        body.extend_from_slice(self.suffix());

        self.docs.clear();
        (body.freeze(), std::mem::take(&mut self.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &'static str) -> PendingDoc {
        PendingDoc::new(Bytes::from_static(body.as_bytes()), false).0
    }

    #[test]
    fn test_framing_default_mode() {
        let mut batch = Batch::new(true);
        batch.push(doc(r#"{"_id":"a"}"#));
        batch.push(doc(r#"{"_id":"b"}"#));

        let expected = r#"{"docs":[{"_id":"a"},{"_id":"b"}]}"#;
        assert_eq!(batch.encoded_len(), expected.len());

        let (body, pending) = batch.take();
        assert_eq!(body, Bytes::from(expected));
        assert_eq!(pending.len(), 2);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_framing_preserve_mode() {
        let mut batch = Batch::new(false);
        batch.push(doc(r#"{"_id":"a","_rev":"2-x"}"#));

        let (body, _) = batch.take();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["new_edits"], false);
        assert_eq!(value["docs"][0]["_rev"], "2-x");
    }

    #[test]
    fn test_empty_batch_frames_to_empty_array() {
        let mut batch = Batch::new(true);
        let (body, pending) = batch.take();
        assert_eq!(body, Bytes::from_static(b"{\"docs\":[]}"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_would_overflow() {
        let mut batch = Batch::new(true);
        // an empty batch accepts anything
        assert!(!batch.would_overflow(1000, 1, Some(10)));

        batch.push(doc("{}"));
        // {"docs":[{}]} is 13 bytes; adding ,{} makes 16
        assert_eq!(batch.encoded_len_with(2), 16);
        assert!(!batch.would_overflow(2, 10, Some(16)));
        assert!(batch.would_overflow(2, 10, Some(15)));
        assert!(batch.would_overflow(2, 1, None));
    }

    #[test]
    fn test_priority_reported() {
        let mut batch = Batch::new(true);
        let (urgent, _job) = PendingDoc::new(Bytes::from_static(b"{}"), true);
        assert!(batch.push(urgent));
    }
}
