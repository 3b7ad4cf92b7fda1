//! Fan-out error types

use thiserror::Error;

/// Structural fault in a source data stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The stream ended before the size the file system reported.
    #[error("stream for {file} ended at offset {offset} but the file reports {expected} bytes")]
    EarlyStreamEnd {
        file: String,
        offset: u64,
        expected: u64,
    },
}

impl StreamError {
    /// Wrap as an `io::Error` so it can travel through `AsyncRead`.
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, self)
    }
}

/// Find a [`StreamError`] anywhere in an error chain, including inside an
/// `io::Error` raised by a reader.
pub fn find_stream_error(err: &anyhow::Error) -> Option<&StreamError> {
    err.chain().find_map(|e| {
        if let Some(found) = e.downcast_ref::<StreamError>() {
            return Some(found);
        }
        e.downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
            .and_then(|inner| inner.downcast_ref::<StreamError>())
    })
}
