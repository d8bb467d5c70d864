//! Prometheus counters for the connection pipeline.
//!
//! Each server owns its own `Registry`, so several servers in one process
//! (as in the test suite) never share counters.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{ServerError, ServerResult};

/// Metrics shared by the acceptor and all I/O workers.
#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,
    /// Connections handed to a worker.
    pub connections_accepted: IntCounter,
    /// Connections currently owned by some worker.
    pub connections_active: IntGauge,
    /// Handshakes that reached the established state.
    pub handshakes_completed: IntCounter,
    /// Handshakes that ended in a TLS error or peer abort.
    pub handshakes_failed: IntCounter,
    /// Handshake steps run on the I/O thread because the pool was full.
    pub handshakes_inline: IntCounter,
    /// Responses produced by the application callback.
    pub requests: IntCounter,
    /// Connections closed by an isolated failure, labelled by reason.
    pub connection_errors: IntCounterVec,
}

impl ServerMetrics {
    /// Creates and registers every collector.
    pub fn new() -> ServerResult<Self> {
        let registry = Registry::new();

        let connections_accepted = IntCounter::new(
            "parapet_connections_accepted_total",
            "Connections accepted and assigned to a worker",
        )?;
        let connections_active =
            IntGauge::new("parapet_connections_active", "Connections currently open")?;
        let handshakes_completed = IntCounter::new(
            "parapet_handshakes_completed_total",
            "TLS handshakes completed",
        )?;
        let handshakes_failed =
            IntCounter::new("parapet_handshakes_failed_total", "TLS handshakes failed")?;
        let handshakes_inline = IntCounter::new(
            "parapet_handshakes_inline_total",
            "Handshake steps run on an I/O worker because the offload queue was full",
        )?;
        let requests = IntCounter::new("parapet_requests_total", "Requests answered")?;
        let connection_errors = IntCounterVec::new(
            Opts::new(
                "parapet_connection_errors_total",
                "Connections closed by an isolated failure",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(connections_accepted.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(handshakes_completed.clone()))?;
        registry.register(Box::new(handshakes_failed.clone()))?;
        registry.register(Box::new(handshakes_inline.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(connection_errors.clone()))?;

        Ok(Self {
            registry,
            connections_accepted,
            connections_active,
            handshakes_completed,
            handshakes_failed,
            handshakes_inline,
            requests,
            connection_errors,
        })
    }

    /// Counts a connection closed because of `error`.
    pub fn record_connection_error(&self, error: &ServerError) {
        self.connection_errors
            .with_label_values(&[error.reason()])
            .inc();
    }

    /// Renders all collectors in the Prometheus text format.
    pub fn render(&self) -> ServerResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ServerError::Metrics(prometheus::Error::Msg(e.to_string())))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics")
            .field("connections_active", &self.connections_active.get())
            .field("requests", &self.requests.get())
            .finish_non_exhaustive()
    }
}
