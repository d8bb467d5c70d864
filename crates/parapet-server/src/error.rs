//! Server error types.

use std::net::SocketAddr;

use parapet_http::HttpError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// TLS configuration or record-layer error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Ephemeral certificate generation failed.
    #[error("certificate generation failed: {0}")]
    Certificate(String),

    /// The TLS handshake with a peer failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Framing or assembly error.
    #[error("http error: {0}")]
    Http(#[from] HttpError),

    /// The application callback failed or panicked.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A thread could not be spawned.
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        source: std::io::Error,
    },

    /// A lifecycle operation was called in the wrong state.
    #[error("invalid server state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Metrics registry error.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ServerError {
    /// Short, stable label used for log fields and error counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::BindFailed { .. } => "bind",
            Self::Tls(_) => "tls",
            Self::Certificate(_) => "certificate",
            Self::Handshake(_) => "handshake",
            Self::Http(HttpError::MessageTooLarge { .. }) => "message_too_large",
            Self::Http(_) => "framing",
            Self::Handler(_) => "handler",
            Self::InvalidConfig(_) => "config",
            Self::Spawn { .. } => "spawn",
            Self::InvalidState { .. } => "state",
            Self::Metrics(_) => "metrics",
        }
    }

    /// Returns true if this error means the process cannot keep serving.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BindFailed { .. } | Self::Spawn { .. } | Self::Certificate(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_limit_and_framing_have_distinct_reasons() {
        let too_large = ServerError::from(HttpError::MessageTooLarge { size: 2, limit: 1 });
        let framing = ServerError::from(HttpError::InvalidContentLength);
        assert_eq!(too_large.reason(), "message_too_large");
        assert_eq!(framing.reason(), "framing");
    }

    #[test]
    fn only_startup_failures_are_fatal() {
        let bind = ServerError::BindFailed {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());
        assert!(!ServerError::Handshake("bad".into()).is_fatal());
    }
}
