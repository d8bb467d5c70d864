//! HTTP framing and assembly errors.

use thiserror::Error;

/// Errors raised while decoding or assembling a request.
///
/// Every variant is fatal for the connection that produced it: the pipeline
/// does not attempt to resynchronise a byte stream once framing is lost.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// The request line or a header line could not be parsed.
    #[error("malformed request head: {0}")]
    MalformedHead(String),

    /// The request head (or chunked trailer block) grew past the limit.
    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    /// Only HTTP/1.0 and HTTP/1.1 are served.
    #[error("unsupported HTTP version 1.{0}")]
    UnsupportedVersion(u8),

    /// `Content-Length` is not a number, or repeated with different values.
    #[error("invalid content-length header")]
    InvalidContentLength,

    /// Both `Content-Length` and `Transfer-Encoding` were sent.
    #[error("conflicting message framing: content-length with transfer-encoding")]
    ConflictingFraming,

    /// A transfer coding other than `chunked` was requested.
    #[error("unsupported transfer-encoding: {0}")]
    UnsupportedTransferEncoding(String),

    /// The chunked body framing is broken.
    #[error("malformed chunked body: {0}")]
    InvalidChunk(&'static str),

    /// The aggregated message body is larger than `max_message_size`.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: u64, limit: usize },

    /// A fragment arrived in a position the assembler cannot accept.
    #[error("unexpected {fragment} fragment")]
    UnexpectedFragment { fragment: &'static str },
}

impl HttpError {
    /// Returns true if this error came from the framing stage rather than
    /// from the assembly size limit.
    pub fn is_framing(&self) -> bool {
        !matches!(self, Self::MessageTooLarge { .. })
    }
}
