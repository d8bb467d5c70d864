//! Connection pipeline: TLS, framing, assembly and the application callback,
//! bound to one socket.
//!
//! ```text
//! ACCEPTED → HANDSHAKING → ESTABLISHED → CLOSING → CLOSED
//!                 │  ▲
//!        session  ▼  │ session + outcome
//!            offload pool
//! ```
//!
//! The stages are fixed when the connection is created. Every method runs on
//! the owning worker thread; the only thing that ever leaves it is the TLS
//! session during an offloaded handshake step, and it comes back through the
//! worker's mailbox.

use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};

use bytes::BytesMut;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use parapet_http::{
    Assembled, Assembler, EncodeOptions, Method, Request, RequestDecoder, encode_continue,
    encode_response,
};
use rustls::ServerConnection;

use crate::buffer_pool::BufferPool;
use crate::error::{ServerError, ServerResult};
use crate::handler::SharedHandler;
use crate::metrics::ServerMetrics;
use crate::tls::{CiphertextRead, HandshakeOutcome, PlaintextState, TlsStage};

/// Byte stream a connection runs over.
pub trait Transport: Read + Write {
    /// Shuts down both directions of the stream.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for mio::net::TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Established,
    /// No further requests are read; queued output is flushed, then closed.
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// What the owning worker must do after an event was handled.
#[derive(Debug)]
pub enum Advance {
    /// Keep the connection; refresh its interest.
    Continue,
    /// Run a handshake step on the offload pool and hand the session back.
    Offload(Box<ServerConnection>),
    /// The connection is finished and should be closed gracefully.
    Close,
}

/// How a connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Send `close_notify` and flush what the socket accepts.
    Graceful,
    /// Drop pending output.
    Abort,
}

/// Parameters fixed for every connection of a server.
#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub max_head_size: usize,
    pub max_message_size: usize,
}

/// One accepted socket and its processing pipeline.
pub struct Connection<S: Transport> {
    token: Token,
    peer: SocketAddr,
    socket: S,
    state: ConnectionState,
    tls: TlsStage,
    decoder: RequestDecoder,
    assembler: Assembler,
    handler: SharedHandler,
    /// Decrypted bytes not yet consumed by the decoder.
    inbound: BytesMut,
    /// Encoded responses not yet handed to the TLS stage.
    outbound: BytesMut,
    interest: Interest,
    draining: bool,
    peer_closed: bool,
}

impl<S: Transport> Connection<S> {
    /// Builds the pipeline for a freshly accepted socket.
    pub fn new(
        token: Token,
        peer: SocketAddr,
        socket: S,
        tls: TlsStage,
        limits: PipelineLimits,
        handler: SharedHandler,
        buffers: &BufferPool,
    ) -> Self {
        Self {
            token,
            peer,
            socket,
            state: ConnectionState::Accepted,
            tls,
            decoder: RequestDecoder::new(limits.max_head_size),
            assembler: Assembler::new(limits.max_message_size),
            handler,
            inbound: buffers.checkout(),
            outbound: buffers.checkout(),
            interest: Interest::READABLE,
            draining: false,
            peer_closed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Starts the TLS handshake. The client speaks first, so this only moves
    /// the state forward.
    pub fn begin_handshake(&mut self) {
        if self.state == ConnectionState::Accepted {
            self.transition(ConnectionState::Handshaking);
        }
    }

    /// Handles read readiness.
    pub fn on_readable(&mut self, metrics: &ServerMetrics) -> ServerResult<Advance> {
        // Re-polled by `resume_handshake` once the session is back.
        if self.tls.is_offloaded() {
            return Ok(Advance::Continue);
        }

        match self.state {
            ConnectionState::Handshaking => {
                if let Some(session) = self.read_handshake(metrics)? {
                    return Ok(Advance::Offload(session));
                }
            }
            ConnectionState::Established => self.read_established(metrics)?,
            ConnectionState::Accepted | ConnectionState::Closing | ConnectionState::Closed => {}
        }
        self.finish()
    }

    /// Handles write readiness.
    pub fn on_writable(&mut self) -> ServerResult<Advance> {
        if self.tls.is_offloaded() {
            return Ok(Advance::Continue);
        }
        self.finish()
    }

    /// Takes back the session after an offloaded handshake step.
    ///
    /// Plaintext decrypted alongside the final handshake flight is only
    /// handed to the framing stage here, after completion was observed on
    /// this thread.
    pub fn resume_handshake(
        &mut self,
        session: Box<ServerConnection>,
        outcome: HandshakeOutcome,
        metrics: &ServerMetrics,
    ) -> ServerResult<Advance> {
        self.tls.restore_session(session);

        if let Err(alert) = outcome {
            metrics.handshakes_failed.inc();
            // Best effort: the alert explains the failure to the peer.
            let _ = self.tls.flush(&mut self.socket);
            return Err(ServerError::Handshake(alert));
        }

        if self.state == ConnectionState::Handshaking && !self.tls.is_handshaking() {
            metrics.handshakes_completed.inc();
            self.transition(ConnectionState::Established);
            self.pump_plaintext(metrics)?;
        }

        // Readiness that fired while the session was away is edge-triggered
        // and will not repeat.
        self.on_readable(metrics)
    }

    /// Stops accepting new requests once in-flight ones are answered.
    ///
    /// Bytes already received are read first so a request that arrived just
    /// before the drain is still served.
    pub fn begin_drain(&mut self, metrics: &ServerMetrics) -> ServerResult<Advance> {
        self.draining = true;
        self.on_readable(metrics)
    }

    /// True when nothing is in flight in any stage.
    pub fn is_quiescent(&self) -> bool {
        !self.tls.is_offloaded()
            && self.inbound.is_empty()
            && self.outbound.is_empty()
            && self.decoder.is_idle()
            && self.assembler.is_idle()
            && !self.tls.wants_write()
    }

    /// Interest this connection needs from the poller.
    pub fn interest(&self) -> Interest {
        if self.tls.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Closes the connection and returns its buffers.
    ///
    /// Closing a closed connection does nothing and returns `false`.
    pub fn close(&mut self, mode: CloseMode, buffers: &BufferPool) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }

        if mode == CloseMode::Graceful && !self.tls.is_offloaded() {
            self.tls.send_close_notify();
            let _ = self.tls.flush(&mut self.socket);
        }
        let _ = self.socket.shutdown();

        buffers.checkin(mem::take(&mut self.inbound));
        buffers.checkin(mem::take(&mut self.outbound));
        self.assembler.reset();
        self.transition(ConnectionState::Closed);
        true
    }

    fn read_handshake(
        &mut self,
        metrics: &ServerMetrics,
    ) -> ServerResult<Option<Box<ServerConnection>>> {
        loop {
            match self.tls.read_ciphertext(&mut self.socket)? {
                CiphertextRead::Received(0) => {}
                CiphertextRead::Received(_) => return Ok(self.tls.take_session()),
                CiphertextRead::WouldBlock => return Ok(None),
                CiphertextRead::Eof => {
                    metrics.handshakes_failed.inc();
                    return Err(ServerError::Handshake(
                        "peer closed during handshake".to_string(),
                    ));
                }
            }
        }
    }

    fn read_established(&mut self, metrics: &ServerMetrics) -> ServerResult<()> {
        // Plaintext may already be buffered from an earlier batch.
        self.pump_plaintext(metrics)?;

        while self.state == ConnectionState::Established && !self.peer_closed {
            match self.tls.read_ciphertext(&mut self.socket)? {
                CiphertextRead::Received(_) => self.tls.process()?,
                CiphertextRead::WouldBlock => break,
                CiphertextRead::Eof => {
                    self.peer_closed = true;
                    self.tls.process()?;
                }
            }
            self.pump_plaintext(metrics)?;
        }
        Ok(())
    }

    fn pump_plaintext(&mut self, metrics: &ServerMetrics) -> ServerResult<()> {
        if self.tls.drain_plaintext(&mut self.inbound)? == PlaintextState::Closed {
            self.peer_closed = true;
        }
        self.dispatch(metrics)?;
        self.encrypt_outbound()
    }

    /// Runs framing and assembly over buffered plaintext, answering every
    /// complete request in arrival order.
    ///
    /// After the peer closed or a drain began, every complete request is still
    /// answered; only the one that leaves no buffered bytes behind closes.
    fn dispatch(&mut self, metrics: &ServerMetrics) -> ServerResult<()> {
        while self.state == ConnectionState::Established {
            let Some(fragment) = self.decoder.decode(&mut self.inbound)? else {
                break;
            };
            match self.assembler.push(fragment)? {
                Assembled::Pending => {}
                Assembled::Continue => encode_continue(&mut self.outbound),
                Assembled::Complete(request) => self.respond(request, metrics)?,
            }
        }
        Ok(())
    }

    fn respond(&mut self, request: Request, metrics: &ServerMetrics) -> ServerResult<()> {
        let options = EncodeOptions {
            version: request.version(),
            keep_alive: request.keep_alive() && !(self.is_ending() && self.inbound.is_empty()),
            head_request: *request.method() == Method::Head,
        };

        let handler = &self.handler;
        let response = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request)))
            .map_err(|payload| ServerError::Handler(panic_message(payload.as_ref())))?
            .map_err(|e| ServerError::Handler(e.to_string()))?;

        encode_response(&response, options, &mut self.outbound);
        metrics.requests.inc();

        if !options.keep_alive {
            self.transition(ConnectionState::Closing);
        }
        Ok(())
    }

    /// No requests beyond those already buffered will be read.
    fn is_ending(&self) -> bool {
        self.draining || self.peer_closed
    }

    fn encrypt_outbound(&mut self) -> ServerResult<()> {
        if !self.outbound.is_empty() {
            self.tls.encrypt(&self.outbound)?;
            self.outbound.clear();
        }
        Ok(())
    }

    /// Flushes what the socket accepts and decides whether to close.
    fn finish(&mut self) -> ServerResult<Advance> {
        let flushed = self.tls.flush(&mut self.socket)?;
        if !flushed {
            return Ok(Advance::Continue);
        }

        let done = match self.state {
            ConnectionState::Closing | ConnectionState::Closed => true,
            ConnectionState::Accepted
            | ConnectionState::Handshaking
            | ConnectionState::Established => {
                self.peer_closed || (self.draining && self.is_quiescent())
            }
        };
        Ok(if done { Advance::Close } else { Advance::Continue })
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::debug!(
            token = self.token.0,
            peer = %self.peer,
            from = self.state.as_str(),
            to = next.as_str(),
            "connection state"
        );
        self.state = next;
    }
}

impl<S: Transport + Source> Connection<S> {
    /// Registers the socket with `registry` for read readiness.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.socket, self.token, self.interest)
    }

    /// Re-registers only when the needed interest changed.
    pub fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let wanted = self.interest();
        if wanted != self.interest {
            registry.reregister(&mut self.socket, self.token, wanted)?;
            self.interest = wanted;
        }
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }
}

impl<S: Transport> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token.0)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("tls", &self.tls)
            .field("draining", &self.draining)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::Arc;

    use parapet_http::{HttpError, Response};
    use rustls::ClientConnection;
    use rustls::pki_types::ServerName;

    use super::*;
    use crate::config::TlsEngine;
    use crate::handler::{HandlerError, HelloHandler};
    use crate::tls::tests::client_config;
    use crate::tls::{
        ALPN_HTTP11, SelfSignedCertificate, build_server_config, run_handshake_step,
    };

    #[derive(Default)]
    struct Wire {
        to_server: VecDeque<u8>,
        to_client: Vec<u8>,
        eof: bool,
        shutdowns: usize,
    }

    /// In-memory socket: reads would-block when empty, like a non-blocking
    /// TCP stream.
    #[derive(Clone, Default)]
    struct MemoryStream(Rc<RefCell<Wire>>);

    impl Read for MemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut wire = self.0.borrow_mut();
            if wire.to_server.is_empty() {
                return if wire.eof {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(wire.to_server.len());
            for (slot, byte) in buf.iter_mut().zip(wire.to_server.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MemoryStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().to_client.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MemoryStream {
        fn shutdown(&self) -> io::Result<()> {
            self.0.borrow_mut().shutdowns += 1;
            Ok(())
        }
    }

    struct Harness {
        conn: Connection<MemoryStream>,
        wire: MemoryStream,
        client: ClientConnection,
        metrics: ServerMetrics,
        buffers: BufferPool,
    }

    impl Harness {
        fn new(handler: SharedHandler, max_message_size: usize) -> Self {
            let certificate =
                SelfSignedCertificate::generate(&["localhost".to_string()]).expect("certificate");
            let config = build_server_config(TlsEngine::Ring, &certificate).expect("config");
            let wire = MemoryStream::default();
            let buffers = BufferPool::new(8, 1024, 64 * 1024);
            let mut conn = Connection::new(
                Token(1),
                "127.0.0.1:40000".parse().expect("addr"),
                wire.clone(),
                TlsStage::new(config).expect("stage"),
                PipelineLimits {
                    max_head_size: 8 * 1024,
                    max_message_size,
                },
                handler,
                &buffers,
            );
            conn.begin_handshake();

            let client = ClientConnection::new(
                client_config(TlsEngine::Ring, &certificate, &[ALPN_HTTP11]),
                ServerName::try_from("localhost").expect("name"),
            )
            .expect("client");

            Self {
                conn,
                wire,
                client,
                metrics: ServerMetrics::new().expect("metrics"),
                buffers,
            }
        }

        /// Sends client records to the server side of the wire.
        fn client_send(&mut self) {
            let mut out = Vec::new();
            while self.client.wants_write() {
                self.client.write_tls(&mut out).expect("client write");
            }
            self.wire.0.borrow_mut().to_server.extend(out);
        }

        /// Feeds server output to the client and returns decrypted plaintext.
        fn client_receive(&mut self) -> Vec<u8> {
            let bytes = mem::take(&mut self.wire.0.borrow_mut().to_client);
            let mut cursor = &bytes[..];
            while !cursor.is_empty() {
                self.client.read_tls(&mut cursor).expect("client read");
                self.client.process_new_packets().expect("client process");
            }
            let mut plaintext = Vec::new();
            let _ = self.client.reader().read_to_end(&mut plaintext);
            plaintext
        }

        /// Delivers one readable event, running any handshake step inline.
        fn readable(&mut self) -> ServerResult<Advance> {
            let mut advance = self.conn.on_readable(&self.metrics)?;
            while let Advance::Offload(mut session) = advance {
                let outcome = run_handshake_step(&mut session);
                advance = self.conn.resume_handshake(session, outcome, &self.metrics)?;
            }
            Ok(advance)
        }

        fn handshake(&mut self) {
            for _ in 0..8 {
                self.client_send();
                self.readable().expect("server handshake");
                self.client_receive();
                if !self.client.is_handshaking()
                    && self.conn.state() == ConnectionState::Established
                {
                    return;
                }
            }
            panic!("handshake did not complete");
        }

        fn request(&mut self, raw: &[u8]) -> ServerResult<Advance> {
            self.client.writer().write_all(raw).expect("client plaintext");
            self.client_send();
            self.readable()
        }
    }

    fn hello() -> SharedHandler {
        Arc::new(HelloHandler)
    }

    #[test]
    fn pipelined_requests_are_answered_in_order() {
        let handler: SharedHandler =
            Arc::new(|request: Request| -> Result<Response, HandlerError> {
                Ok(Response::ok(request.target().to_string()))
            });
        let mut h = Harness::new(handler, 1024);
        h.handshake();
        assert_eq!(h.metrics.handshakes_completed.get(), 1);

        let advance = h
            .request(b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\n\r\n")
            .expect("served");
        assert!(matches!(advance, Advance::Continue));

        let text = String::from_utf8(h.client_receive()).expect("utf8");
        let one = text.find("/one").expect("first response");
        let two = text.find("/two").expect("second response");
        assert!(one < two);
        assert_eq!(text.matches("content-length: 4\r\n").count(), 2);
        assert_eq!(h.metrics.requests.get(), 2);
        assert!(h.conn.is_quiescent());
    }

    #[test]
    fn connection_close_request_closes_after_response() {
        let mut h = Harness::new(hello(), 1024);
        h.handshake();

        let advance = h
            .request(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .expect("served");
        assert!(matches!(advance, Advance::Close));
        assert_eq!(h.conn.state(), ConnectionState::Closing);

        let text = String::from_utf8(h.client_receive()).expect("utf8");
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("Hello"));
    }

    #[test]
    fn oversized_body_fails_the_connection() {
        let mut h = Harness::new(hello(), 8);
        h.handshake();

        let err = h
            .request(b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n123456789")
            .expect_err("too large");
        assert!(matches!(
            err,
            ServerError::Http(HttpError::MessageTooLarge { size: 9, limit: 8 })
        ));
        assert_eq!(err.reason(), "message_too_large");
    }

    #[test]
    fn malformed_request_line_is_a_framing_error() {
        let mut h = Harness::new(hello(), 1024);
        h.handshake();
        let err = h.request(b"NOT A REQUEST\r\n\r\n").expect_err("malformed");
        assert_eq!(err.reason(), "framing");
    }

    #[test]
    fn handler_failure_and_panic_are_contained() {
        let failing: SharedHandler = Arc::new(|_: Request| -> Result<Response, HandlerError> {
            Err(HandlerError::new("nope"))
        });
        let mut h = Harness::new(failing, 1024);
        h.handshake();
        let err = h.request(b"GET / HTTP/1.1\r\n\r\n").expect_err("handler error");
        assert_eq!(err.reason(), "handler");

        let panicking: SharedHandler = Arc::new(|_: Request| -> Result<Response, HandlerError> {
            panic!("handler bug")
        });
        let mut h = Harness::new(panicking, 1024);
        h.handshake();
        let err = h.request(b"GET / HTTP/1.1\r\n\r\n").expect_err("panic");
        assert!(err.to_string().contains("handler bug"));
    }

    #[test]
    fn failed_handshake_step_is_reported() {
        let mut h = Harness::new(hello(), 1024);
        h.client_send();
        let Advance::Offload(session) = h.conn.on_readable(&h.metrics).expect("read") else {
            panic!("client hello should be offloaded");
        };
        assert!(!h.conn.is_quiescent(), "offloaded connection is busy");

        let err = h
            .conn
            .resume_handshake(session, Err("bad record".to_string()), &h.metrics)
            .expect_err("failure propagates");
        assert_eq!(err.reason(), "handshake");
        assert_eq!(h.metrics.handshakes_failed.get(), 1);
    }

    #[test]
    fn drain_serves_buffered_request_then_closes() {
        let mut h = Harness::new(hello(), 1024);
        h.handshake();

        h.client.writer().write_all(b"GET / HTTP/1.1\r\n\r\n").expect("plaintext");
        h.client_send();

        let advance = h.conn.begin_drain(&h.metrics).expect("drain");
        assert!(matches!(advance, Advance::Close));
        let text = String::from_utf8(h.client_receive()).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("connection: close\r\n"));
    }

    fn echo_target() -> SharedHandler {
        Arc::new(|request: Request| -> Result<Response, HandlerError> {
            Ok(Response::ok(request.target().to_string()))
        })
    }

    const TWO_REQUESTS: &[u8] =
        b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\n\r\n";

    #[test]
    fn close_notify_after_pipelined_requests_answers_all_of_them() {
        let mut h = Harness::new(echo_target(), 1024);
        h.handshake();

        h.client.writer().write_all(TWO_REQUESTS).expect("plaintext");
        h.client.send_close_notify();
        h.client_send();

        let advance = h.readable().expect("served");
        assert!(matches!(advance, Advance::Close));
        assert_eq!(h.metrics.requests.get(), 2);

        let text = String::from_utf8(h.client_receive()).expect("utf8");
        let (first, second) = text.split_once("/one").expect("first response");
        assert!(!first.contains("connection: close"));
        assert!(second.contains("connection: close\r\n"));
        assert!(second.ends_with("/two"));
    }

    #[test]
    fn drain_answers_every_buffered_pipelined_request() {
        let mut h = Harness::new(echo_target(), 1024);
        h.handshake();

        h.client.writer().write_all(TWO_REQUESTS).expect("plaintext");
        h.client_send();

        let advance = h.conn.begin_drain(&h.metrics).expect("drain");
        assert!(matches!(advance, Advance::Close));
        assert_eq!(h.metrics.requests.get(), 2);

        let text = String::from_utf8(h.client_receive()).expect("utf8");
        assert_eq!(text.matches("connection: close\r\n").count(), 1);
        let one = text.find("/one").expect("first response");
        let close = text.find("connection: close").expect("close marker");
        assert!(one < close);
        assert!(text.ends_with("/two"));
    }

    #[test]
    fn peer_abort_during_handshake_counts_as_failed() {
        let mut h = Harness::new(hello(), 1024);
        h.wire.0.borrow_mut().eof = true;

        let err = h.conn.on_readable(&h.metrics).expect_err("aborted");
        assert_eq!(err.reason(), "handshake");
        assert_eq!(h.metrics.handshakes_failed.get(), 1);
        assert_eq!(h.metrics.handshakes_completed.get(), 0);
    }

    #[test]
    fn idle_connection_closes_on_drain() {
        let mut h = Harness::new(hello(), 1024);
        h.handshake();
        let advance = h.conn.begin_drain(&h.metrics).expect("drain");
        assert!(matches!(advance, Advance::Close));
    }

    #[test]
    fn peer_eof_closes_after_serving() {
        let mut h = Harness::new(hello(), 1024);
        h.handshake();
        h.client.writer().write_all(b"GET / HTTP/1.1\r\n\r\n").expect("plaintext");
        h.client_send();
        h.wire.0.borrow_mut().eof = true;

        let advance = h.readable().expect("served");
        assert!(matches!(advance, Advance::Close));
        assert!(h.client_receive().ends_with(b"Hello"));
    }

    #[test]
    fn close_is_idempotent() {
        let mut h = Harness::new(hello(), 1024);
        h.handshake();

        assert!(h.conn.close(CloseMode::Graceful, &h.buffers));
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert!(!h.conn.close(CloseMode::Graceful, &h.buffers));
        assert!(!h.conn.close(CloseMode::Abort, &h.buffers));
        assert_eq!(h.wire.0.borrow().shutdowns, 1);
        assert_eq!(h.buffers.idle(), 2, "both buffers returned once");
    }
}
