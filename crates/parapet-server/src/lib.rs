//! # parapet-server: TLS-terminating HTTP/1.1 server daemon
//!
//! This crate accepts TCP connections, terminates TLS with an ephemeral
//! self-signed certificate, decodes HTTP/1.1 with `parapet-http` and hands
//! each complete request to an application [`Handler`].
//!
//! ## Architecture
//!
//! The server uses `mio` for non-blocking I/O with poll-based event loops and
//! plain threads, no async runtime.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         parapet-server                           │
//! │  ┌──────────┐    ┌──────────────────────────┐   ┌─────────────┐  │
//! │  │ Acceptor │ →  │ IoWorker × N (mio poll)  │ ⇄ │ OffloadPool │  │
//! │  │  (TCP)   │    │  Connection pipelines:   │   │ (handshake) │  │
//! │  └──────────┘    │  TLS → framing → assembly│   └─────────────┘  │
//! │                  │      → Handler           │                    │
//! │                  └──────────────────────────┘                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each connection is owned by exactly one worker for its whole life. The
//! only state that crosses threads is the rustls session during an offloaded
//! handshake step, and it is moved, not shared.
//!
//! ## Usage
//!
//! ```ignore
//! use parapet_server::{HelloHandler, Server, ServerConfig, TlsEngine};
//!
//! let config = ServerConfig::new(([0, 0, 0, 0], 8081), TlsEngine::AwsLcRs);
//! let server = Server::with_signal_handling(config, HelloHandler)?;
//! server.run()?;
//! ```

pub mod acceptor;
pub mod buffer_pool;
mod config;
pub mod connection;
mod error;
mod handler;
pub mod metrics;
pub mod offload;
mod server;
pub mod tls;
pub mod worker;

pub use buffer_pool::BufferPool;
pub use config::{
    Balance, DEFAULT_BACKLOG, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SHUTDOWN_TIMEOUT, ServerConfig,
    TlsEngine, default_parallelism,
};
pub use error::{ServerError, ServerResult};
pub use handler::{Handler, HandlerError, HelloHandler, SharedHandler};
pub use metrics::ServerMetrics;
pub use server::{Server, ServerState, ShutdownHandle, ShutdownReport};
pub use tls::SelfSignedCertificate;
