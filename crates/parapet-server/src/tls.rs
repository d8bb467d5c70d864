//! TLS stage: ephemeral certificate, rustls configuration, and the
//! per-connection session wrapper.
//!
//! The session is held in an `Option` so the handshake step can move it to the
//! offload pool and have it moved back by the owning worker. While it is away
//! the stage reports [`TlsStage::is_offloaded`] and performs no I/O.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::BytesMut;
use rcgen::CertifiedKey;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig as RustlsServerConfig, ServerConnection};

use crate::config::TlsEngine;
use crate::error::{ServerError, ServerResult};

/// ALPN identifier advertised by the server.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Size of the stack buffer used to pull decrypted bytes out of a session.
const PLAINTEXT_CHUNK: usize = 8 * 1024;

/// Ephemeral self-signed certificate generated once at startup.
///
/// Read-only after construction and shared by every connection through the
/// rustls configuration.
pub struct SelfSignedCertificate {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl SelfSignedCertificate {
    /// Generates a fresh key pair and certificate for `subject_alt_names`.
    pub fn generate(subject_alt_names: &[String]) -> ServerResult<Self> {
        let CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(subject_alt_names.to_vec())
                .map_err(|e| ServerError::Certificate(e.to_string()))?;

        Ok(Self {
            cert: cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        })
    }

    /// DER encoding of the certificate. Clients add this to their trust store.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }
}

impl fmt::Debug for SelfSignedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfSignedCertificate")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

/// Returns the rustls crypto provider backing `engine`.
pub fn crypto_provider(engine: TlsEngine) -> CryptoProvider {
    match engine {
        TlsEngine::AwsLcRs => rustls::crypto::aws_lc_rs::default_provider(),
        TlsEngine::Ring => rustls::crypto::ring::default_provider(),
    }
}

/// Builds the shared rustls server configuration.
pub fn build_server_config(
    engine: TlsEngine,
    certificate: &SelfSignedCertificate,
) -> ServerResult<Arc<RustlsServerConfig>> {
    let mut config = RustlsServerConfig::builder_with_provider(Arc::new(crypto_provider(engine)))
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(format!("unsupported protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![certificate.der().clone()], certificate.private_key())
        .map_err(|e| ServerError::Tls(format!("invalid certificate: {e}")))?;

    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    Ok(Arc::new(config))
}

/// Result of one handshake step. The error is the rustls alert description.
pub type HandshakeOutcome = Result<(), String>;

/// Runs the CPU-heavy part of a handshake step on the calling thread.
///
/// This is what the offload pool executes on a session moved out of its
/// connection.
pub fn run_handshake_step(session: &mut ServerConnection) -> HandshakeOutcome {
    session
        .process_new_packets()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Result of pulling ciphertext from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextRead {
    /// Bytes were buffered in the session.
    Received(usize),
    /// The socket has nothing more right now.
    WouldBlock,
    /// The peer closed its side of the TCP stream.
    Eof,
}

/// Whether the peer is still sending after a plaintext drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextState {
    Open,
    /// `close_notify` or TCP EOF was observed.
    Closed,
}

/// Per-connection TLS session.
pub struct TlsStage {
    session: Option<Box<ServerConnection>>,
}

impl TlsStage {
    /// Creates a server session in the handshaking state.
    pub fn new(config: Arc<RustlsServerConfig>) -> ServerResult<Self> {
        let mut session = ServerConnection::new(config)
            .map_err(|e| ServerError::Tls(format!("failed to create TLS session: {e}")))?;
        // Outbound plaintext is bounded by the response queue, not by rustls.
        session.set_buffer_limit(None);
        Ok(Self {
            session: Some(Box::new(session)),
        })
    }

    /// Returns true while the session is out on the offload pool.
    pub fn is_offloaded(&self) -> bool {
        self.session.is_none()
    }

    /// Returns true until the handshake has completed.
    pub fn is_handshaking(&self) -> bool {
        self.session.as_ref().is_none_or(|s| s.is_handshaking())
    }

    /// Moves the session out for an offloaded handshake step.
    pub fn take_session(&mut self) -> Option<Box<ServerConnection>> {
        self.session.take()
    }

    /// Returns a session previously taken with [`Self::take_session`].
    pub fn restore_session(&mut self, session: Box<ServerConnection>) {
        debug_assert!(self.session.is_none(), "session restored twice");
        self.session = Some(session);
    }

    /// Reads one batch of ciphertext from `socket` into the session.
    pub fn read_ciphertext(&mut self, socket: &mut impl Read) -> ServerResult<CiphertextRead> {
        let session = self.session_mut()?;
        match session.read_tls(socket) {
            Ok(0) => Ok(CiphertextRead::Eof),
            Ok(n) => Ok(CiphertextRead::Received(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(CiphertextRead::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(CiphertextRead::Received(0)),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    /// Processes buffered records on the current thread.
    pub fn process(&mut self) -> ServerResult<()> {
        let handshaking = self.is_handshaking();
        let session = self.session_mut()?;
        session.process_new_packets().map(|_| ()).map_err(|e| {
            if handshaking {
                ServerError::Handshake(e.to_string())
            } else {
                ServerError::Tls(e.to_string())
            }
        })
    }

    /// Moves every available decrypted byte into `dst`.
    pub fn drain_plaintext(&mut self, dst: &mut BytesMut) -> ServerResult<PlaintextState> {
        let session = self.session_mut()?;
        let mut chunk = [0u8; PLAINTEXT_CHUNK];
        loop {
            match session.reader().read(&mut chunk) {
                Ok(0) => return Ok(PlaintextState::Closed),
                Ok(n) => dst.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(PlaintextState::Open),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(PlaintextState::Closed);
                }
                Err(e) => return Err(ServerError::Io(e)),
            }
        }
    }

    /// Queues `plaintext` for encryption.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> ServerResult<()> {
        let session = self.session_mut()?;
        session.writer().write_all(plaintext)?;
        Ok(())
    }

    /// Writes queued records to `socket`.
    ///
    /// Returns `true` once nothing is left to send.
    pub fn flush(&mut self, socket: &mut impl Write) -> ServerResult<bool> {
        let session = self.session_mut()?;
        while session.wants_write() {
            match session.write_tls(socket) {
                Ok(0) => {
                    return Err(ServerError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write TLS records",
                    )));
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ServerError::Io(e)),
            }
        }
        Ok(true)
    }

    /// Returns true if encrypted output is waiting for the socket.
    pub fn wants_write(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.wants_write())
    }

    /// Queues a `close_notify` alert. No-op while offloaded.
    pub fn send_close_notify(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.send_close_notify();
        }
    }

    fn session_mut(&mut self) -> ServerResult<&mut ServerConnection> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| ServerError::Tls("session is offloaded".to_string()))
    }
}

impl fmt::Debug for TlsStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStage")
            .field("offloaded", &self.is_offloaded())
            .field("handshaking", &self.is_handshaking())
            .finish()
    }
}
