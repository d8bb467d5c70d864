//! Server configuration.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 15 * 1024;

/// Default cap on an aggregated request body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default shutdown drain budget.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Cryptographic engine backing the TLS stage.
///
/// The set is fixed at compile time; the engine is chosen once at process
/// start and shared by every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsEngine {
    /// rustls with the aws-lc-rs provider.
    AwsLcRs,
    /// rustls with the ring provider.
    Ring,
}

impl TlsEngine {
    /// Every supported engine, in display order.
    pub const ALL: [Self; 2] = [Self::AwsLcRs, Self::Ring];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwsLcRs => "aws-lc-rs",
            Self::Ring => "ring",
        }
    }
}

impl fmt::Display for TlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsEngine {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "aws-lc-rs" | "aws-lc" | "awslc" => Ok(Self::AwsLcRs),
            "ring" => Ok(Self::Ring),
            _ => Err(ServerError::InvalidConfig(format!(
                "unknown TLS engine '{s}' (supported: {})",
                Self::ALL.map(Self::as_str).join(", ")
            ))),
        }
    }
}

/// How the acceptor picks an I/O worker for a new connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Balance {
    /// Rotate through workers in order.
    #[default]
    RoundRobin,
    /// Pick the worker owning the fewest live connections.
    LeastLoaded,
}

impl FromStr for Balance {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Self::RoundRobin),
            "least-loaded" => Ok(Self::LeastLoaded),
            other => Err(ServerError::InvalidConfig(format!(
                "unknown balance strategy '{other}'"
            ))),
        }
    }
}

/// Server configuration. Immutable once handed to [`crate::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Listen backlog passed to the OS.
    pub backlog: u32,
    /// TLS engine.
    pub tls_engine: TlsEngine,
    /// Largest aggregated request body accepted.
    pub max_message_size: usize,
    /// Largest request head (request line plus headers) accepted.
    pub max_head_size: usize,
    /// Number of I/O event-loop workers.
    pub io_workers: usize,
    /// Number of handshake offload threads.
    pub handshake_workers: usize,
    /// Capacity of the handshake offload queue.
    pub handshake_queue_capacity: usize,
    /// Worker selection strategy.
    pub balance: Balance,
    /// Initial capacity of per-connection buffers.
    pub read_buffer_size: usize,
    /// Buffers grown past this are not returned to the pool.
    pub max_pooled_buffer_size: usize,
    /// How long a graceful drain may take before connections are forced shut.
    pub shutdown_timeout: Duration,
    /// Subject alternative names on the ephemeral certificate.
    pub subject_alt_names: Vec<String>,
}

impl ServerConfig {
    /// Creates a configuration with defaults for everything but the address
    /// and the TLS engine.
    pub fn new(bind_addr: impl Into<SocketAddr>, tls_engine: TlsEngine) -> Self {
        let parallelism = default_parallelism();
        Self {
            bind_addr: bind_addr.into(),
            backlog: DEFAULT_BACKLOG,
            tls_engine,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_head_size: parapet_http::DEFAULT_MAX_HEAD_SIZE,
            io_workers: parallelism,
            handshake_workers: parallelism,
            handshake_queue_capacity: 1024,
            balance: Balance::default(),
            read_buffer_size: 16 * 1024,
            max_pooled_buffer_size: 256 * 1024,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            subject_alt_names: vec!["localhost".to_string()],
        }
    }

    /// Sets the listen backlog.
    #[must_use]
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the maximum aggregated message size.
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the maximum request head size.
    #[must_use]
    pub fn with_max_head_size(mut self, size: usize) -> Self {
        self.max_head_size = size;
        self
    }

    /// Sets the number of I/O workers.
    #[must_use]
    pub fn with_io_workers(mut self, count: usize) -> Self {
        self.io_workers = count;
        self
    }

    /// Sets the number of handshake offload threads.
    #[must_use]
    pub fn with_handshake_workers(mut self, count: usize) -> Self {
        self.handshake_workers = count;
        self
    }

    /// Sets the handshake offload queue capacity.
    #[must_use]
    pub fn with_handshake_queue_capacity(mut self, capacity: usize) -> Self {
        self.handshake_queue_capacity = capacity;
        self
    }

    /// Sets the worker selection strategy.
    #[must_use]
    pub fn with_balance(mut self, balance: Balance) -> Self {
        self.balance = balance;
        self
    }

    /// Sets the per-connection buffer size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Sets the graceful shutdown budget.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Replaces the certificate subject alternative names.
    #[must_use]
    pub fn with_subject_alt_names(mut self, names: Vec<String>) -> Self {
        self.subject_alt_names = names;
        self
    }

    /// Checks every limit is positive and finite.
    pub fn validate(&self) -> ServerResult<()> {
        let positive = [
            ("backlog", self.backlog as usize),
            ("max_message_size", self.max_message_size),
            ("max_head_size", self.max_head_size),
            ("io_workers", self.io_workers),
            ("handshake_workers", self.handshake_workers),
            ("handshake_queue_capacity", self.handshake_queue_capacity),
            ("read_buffer_size", self.read_buffer_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ServerError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if i32::try_from(self.backlog).is_err() {
            return Err(ServerError::InvalidConfig(format!(
                "backlog {} exceeds the platform maximum",
                self.backlog
            )));
        }
        if self.max_pooled_buffer_size < self.read_buffer_size {
            return Err(ServerError::InvalidConfig(format!(
                "max_pooled_buffer_size {} is below read_buffer_size {}",
                self.max_pooled_buffer_size, self.read_buffer_size
            )));
        }
        if self.subject_alt_names.is_empty() {
            return Err(ServerError::InvalidConfig(
                "at least one subject alternative name is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Available parallelism, falling back to one.
pub fn default_parallelism() -> usize {
    thread::available_parallelism().map_or(1, std::num::NonZero::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig::new(([127, 0, 0, 1], 8081), TlsEngine::AwsLcRs)
    }

    #[test]
    fn defaults_are_finite_and_valid() {
        let config = config();
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.io_workers >= 1);
        assert!(config.handshake_workers >= 1);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = config()
            .with_max_message_size(0)
            .validate()
            .expect_err("zero max_message_size");
        assert!(err.to_string().contains("max_message_size"));

        assert!(config().with_io_workers(0).validate().is_err());
        assert!(config().with_backlog(0).validate().is_err());
        assert!(config().with_subject_alt_names(Vec::new()).validate().is_err());
    }

    #[test]
    fn engine_names_parse_leniently() {
        assert_eq!("aws-lc-rs".parse::<TlsEngine>().ok(), Some(TlsEngine::AwsLcRs));
        assert_eq!("AWS_LC_RS".parse::<TlsEngine>().ok(), Some(TlsEngine::AwsLcRs));
        assert_eq!(" Ring ".parse::<TlsEngine>().ok(), Some(TlsEngine::Ring));

        let err = "openssl".parse::<TlsEngine>().expect_err("unsupported engine");
        assert!(err.to_string().contains("aws-lc-rs, ring"));
    }

    #[test]
    fn engine_display_matches_parse() {
        for engine in TlsEngine::ALL {
            assert_eq!(engine.to_string().parse::<TlsEngine>().ok(), Some(engine));
        }
    }

    #[test]
    fn balance_parses_both_strategies() {
        assert_eq!("round_robin".parse::<Balance>().ok(), Some(Balance::RoundRobin));
        assert_eq!("least-loaded".parse::<Balance>().ok(), Some(Balance::LeastLoaded));
        assert!("random".parse::<Balance>().is_err());
    }
}
