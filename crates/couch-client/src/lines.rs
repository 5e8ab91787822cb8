//! Newline-delimited reading of streamed bodies

use crate::transport::ByteStream;
use bytes::Bytes;
use couch_core::error::{CouchError, Result};
use futures::{Stream, StreamExt, TryStreamExt};
use std::io;
use std::pin::Pin;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

/// Longest line accepted by [`LineReader::new`]
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

type IoStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Splits a streamed body into lines
///
/// `\n` and `\r\n` terminators are stripped. An unterminated tail at end of
/// stream is returned as a final line. The first error ends the stream.
pub struct LineReader {
    lines: FramedRead<StreamReader<IoStream, Bytes>, LinesCodec>,
    max_length: usize,
    failed: bool,
}

impl LineReader {
    pub fn new(stream: ByteStream) -> Self {
        Self::with_max_length(stream, MAX_LINE_BYTES)
    }

    /// Reader rejecting lines longer than `max_length` bytes with a decode error
    pub fn with_max_length(stream: ByteStream, max_length: usize) -> Self {
        let stream: IoStream = Box::pin(stream.map_err(io::Error::other));
        Self {
            lines: FramedRead::new(
                StreamReader::new(stream),
                LinesCodec::new_with_max_length(max_length),
            ),
            max_length,
            failed: false,
        }
    }

    /// Next line without its terminator, `None` at end of stream
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        if self.failed {
            return Ok(None);
        }

        let err = match self.lines.next().await {
            None => return Ok(None),
            Some(Ok(line)) => return Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                CouchError::decode(format!("line longer than {} bytes", self.max_length))
            }
            Some(Err(LinesCodecError::Io(e))) => read_error(e),
        };
        self.failed = true;
        Err(err)
    }
}

/// Recover the body stream's own error from the reader's `io::Error`
fn read_error(err: io::Error) -> CouchError {
    let message = err.to_string();
    match err.into_inner().map(|inner| inner.downcast::<CouchError>()) {
        Some(Ok(err)) => *err,
        _ => CouchError::transport(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, CouchError>(Bytes::from_static(c.as_bytes()))),
        ))
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let mut lines = LineReader::new(stream(vec!["{\"seq\":", "1}\n\n{\"se", "q\":2}\r\n"]));

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("{\"seq\":1}"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("{\"seq\":2}"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_last_line() {
        let mut lines = LineReader::new(stream(vec!["a\nb"]));

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("a"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("b"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overlong_line_ends_stream() {
        let mut lines =
            LineReader::with_max_length(stream(vec!["short\n", "0123456789abc\n", "next\n"]), 8);

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("short"));
        assert!(matches!(lines.next_line().await, Err(CouchError::Decode { .. })));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let body: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a\n")),
            Err(CouchError::transport("reset")),
        ]));
        let mut lines = LineReader::new(body);

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("a"));
        assert!(matches!(
            lines.next_line().await,
            Err(CouchError::Transport { .. })
        ));
    }
}
