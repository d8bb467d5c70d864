//! I/O worker: one `mio` event loop owning a disjoint set of connections.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── IoWorker ─────────────────────────┐
//! │  Poll                                                     │
//! │   ├─ WAKER_TOKEN ──→ mailbox: Register / HandshakeStep /  │
//! │   │                           Drain / Abort               │
//! │   └─ Token(n ≥ 1) ─→ Connection pipeline                  │
//! │                         │  ▲                              │
//! │            OffloadTask  ▼  │  HandshakeStep via mailbox   │
//! │                     offload pool                          │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Connection tokens count up from 1 and are never reused, so a handshake
//! result arriving for a connection that has since closed finds no entry and
//! is dropped.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use rustls::{ServerConfig as RustlsServerConfig, ServerConnection};

use crate::buffer_pool::BufferPool;
use crate::connection::{Advance, CloseMode, Connection, PipelineLimits};
use crate::error::{ServerError, ServerResult};
use crate::handler::SharedHandler;
use crate::metrics::ServerMetrics;
use crate::offload::{OffloadSubmitter, OffloadTask, Saturated};
use crate::tls::{HandshakeOutcome, TlsStage, run_handshake_step};

/// Token for the worker's mailbox waker.
pub const WAKER_TOKEN: Token = Token(0);

/// First token handed to a connection.
const FIRST_CONNECTION_TOKEN: usize = 1;

/// Maximum events to process per poll.
const MAX_EVENTS: usize = 1024;

/// Commands delivered to a worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Take ownership of a freshly accepted socket.
    Register { stream: TcpStream, peer: SocketAddr },
    /// A handshake step finished on the offload pool.
    HandshakeStep {
        token: Token,
        session: Box<ServerConnection>,
        outcome: HandshakeOutcome,
    },
    /// Finish in-flight exchanges, close everything, then exit.
    Drain,
    /// Close everything immediately and exit.
    Abort,
}

/// Sending half of a worker's command channel plus the waker that
/// interrupts its poll.
#[derive(Clone)]
pub struct Mailbox {
    tx: Sender<WorkerCommand>,
    waker: Arc<Waker>,
}

impl Mailbox {
    /// Delivers `command` and wakes the worker.
    ///
    /// Returns `false` if the worker has already exited.
    pub fn deliver(&self, command: WorkerCommand) -> bool {
        if self.tx.send(command).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            tracing::error!(error = %e, "failed to wake worker");
        }
        true
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.tx.len())
            .finish()
    }
}

/// What the acceptor needs to hand a connection to a worker.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    index: usize,
    mailbox: Mailbox,
    load: Arc<AtomicUsize>,
}

impl WorkerLink {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Connections assigned to this worker and not yet closed.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Records a connection handed to this worker.
    pub fn assign(&self) {
        self.load.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection this worker no longer owns.
    pub fn release(&self) {
        self.load.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    link: WorkerLink,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn link(&self) -> &WorkerLink {
        &self.link
    }

    /// Waits for the thread to exit. Safe to call multiple times.
    pub fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.join().is_err() {
            tracing::error!(worker = self.link.index, "worker thread panicked");
        }
    }
}

/// State every worker shares read-only.
#[derive(Clone)]
pub struct WorkerShared {
    pub tls_config: Arc<RustlsServerConfig>,
    pub handler: SharedHandler,
    pub limits: PipelineLimits,
    pub buffers: Arc<BufferPool>,
    pub metrics: ServerMetrics,
}

enum Flow {
    Continue,
    Exit,
}

/// Single-threaded event loop over the connections it owns.
pub struct IoWorker {
    index: usize,
    poll: Poll,
    commands: Receiver<WorkerCommand>,
    /// Own mailbox, handed to offloaded tasks for their completion.
    mailbox: Mailbox,
    load: Arc<AtomicUsize>,
    connections: HashMap<Token, Connection<TcpStream>>,
    next_token: usize,
    draining: bool,
    shared: WorkerShared,
    offload: OffloadSubmitter,
}

impl IoWorker {
    /// Spawns worker `index`. `done` receives the index when the thread exits.
    pub fn spawn(
        index: usize,
        shared: WorkerShared,
        offload: OffloadSubmitter,
        done: Sender<usize>,
    ) -> ServerResult<WorkerHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, commands) = crossbeam_channel::unbounded();
        let mailbox = Mailbox { tx, waker };
        let load = Arc::new(AtomicUsize::new(0));

        let worker = Self {
            index,
            poll,
            commands,
            mailbox: mailbox.clone(),
            load: Arc::clone(&load),
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            draining: false,
            shared,
            offload,
        };

        let thread = thread::Builder::new()
            .name(format!("parapet-io-{index}"))
            .spawn(move || {
                worker.run();
                let _ = done.send(index);
            })
            .map_err(|source| ServerError::Spawn {
                what: format!("I/O worker {index}"),
                source,
            })?;

        Ok(WorkerHandle {
            link: WorkerLink {
                index,
                mailbox,
                load,
            },
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        tracing::debug!(worker = self.index, "worker started");
        let mut events = Events::with_capacity(MAX_EVENTS);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(worker = self.index, error = %e, "poll failed");
                self.abort_all();
                break;
            }

            for event in &events {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                self.on_event(token, readable, writable);
            }

            if let Flow::Exit = self.handle_commands() {
                break;
            }
            if self.draining && self.connections.is_empty() {
                break;
            }
        }

        tracing::debug!(worker = self.index, "worker stopped");
    }

    fn on_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut result = Ok(Advance::Continue);
        if readable {
            result = conn.on_readable(&self.shared.metrics);
        }
        if writable && matches!(result, Ok(Advance::Continue)) {
            result = conn.on_writable();
        }
        self.apply(token, result);
    }

    fn handle_commands(&mut self) -> Flow {
        loop {
            match self.commands.try_recv() {
                Ok(WorkerCommand::Register { stream, peer }) => self.register(stream, peer),
                Ok(WorkerCommand::HandshakeStep {
                    token,
                    session,
                    outcome,
                }) => self.resume_handshake(token, session, outcome),
                Ok(WorkerCommand::Drain) => self.begin_drain(),
                Ok(WorkerCommand::Abort) => {
                    self.abort_all();
                    return Flow::Exit;
                }
                // The worker holds its own sender, so the channel never
                // disconnects while it runs.
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Flow::Continue,
            }
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.draining {
            tracing::debug!(worker = self.index, %peer, "refusing connection while draining");
            self.load.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let tls = match TlsStage::new(Arc::clone(&self.shared.tls_config)) {
            Ok(tls) => tls,
            Err(error) => {
                tracing::warn!(worker = self.index, %peer, %error, "failed to create TLS session");
                self.shared.metrics.record_connection_error(&error);
                self.load.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;

        let mut conn = Connection::new(
            token,
            peer,
            stream,
            tls,
            self.shared.limits,
            Arc::clone(&self.shared.handler),
            &self.shared.buffers,
        );
        if let Err(e) = conn.register(self.poll.registry()) {
            let error = ServerError::Io(e);
            tracing::warn!(worker = self.index, %peer, %error, "failed to register connection");
            self.shared.metrics.record_connection_error(&error);
            conn.close(CloseMode::Abort, &self.shared.buffers);
            self.load.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        conn.begin_handshake();
        self.connections.insert(token, conn);
        self.shared.metrics.connections_active.inc();
        tracing::debug!(worker = self.index, token = token.0, %peer, "connection registered");

        // The ClientHello may have arrived before registration.
        if let Some(conn) = self.connections.get_mut(&token) {
            let result = conn.on_readable(&self.shared.metrics);
            self.apply(token, result);
        }
    }

    fn resume_handshake(
        &mut self,
        token: Token,
        session: Box<ServerConnection>,
        outcome: HandshakeOutcome,
    ) {
        let Some(conn) = self.connections.get_mut(&token) else {
            tracing::debug!(
                worker = self.index,
                token = token.0,
                "discarding handshake result for closed connection"
            );
            return;
        };
        let result = conn.resume_handshake(session, outcome, &self.shared.metrics);
        self.apply(token, result);
    }

    fn offload_handshake(&mut self, token: Token, session: Box<ServerConnection>) {
        let mailbox = self.mailbox.clone();
        let task = OffloadTask::new(move || {
            let mut session = session;
            let outcome = run_handshake_step(&mut session);
            mailbox.deliver(WorkerCommand::HandshakeStep {
                token,
                session,
                outcome,
            });
        });

        if let Err(Saturated(task)) = self.offload.submit(task) {
            self.shared.metrics.handshakes_inline.inc();
            tracing::warn!(
                worker = self.index,
                token = token.0,
                "offload queue full, running handshake step inline"
            );
            // The result still arrives through the mailbox.
            task.run_inline();
        }
    }

    fn apply(&mut self, token: Token, result: ServerResult<Advance>) {
        match result {
            Ok(Advance::Continue) => self.refresh_interest(token),
            Ok(Advance::Offload(session)) => {
                self.offload_handshake(token, session);
                self.refresh_interest(token);
            }
            Ok(Advance::Close) => self.close(token, CloseMode::Graceful),
            Err(error) => self.fail(token, &error),
        }
    }

    fn refresh_interest(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Err(e) = conn.sync_interest(self.poll.registry()) {
            self.fail(token, &ServerError::Io(e));
        }
    }

    /// Contains a per-connection failure: log, count, close.
    fn fail(&mut self, token: Token, error: &ServerError) {
        tracing::debug!(
            worker = self.index,
            token = token.0,
            reason = error.reason(),
            %error,
            "closing connection after error"
        );
        self.shared.metrics.record_connection_error(error);
        self.close(token, CloseMode::Graceful);
    }

    fn close(&mut self, token: Token, mode: CloseMode) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        let _ = conn.deregister(self.poll.registry());
        if conn.close(mode, &self.shared.buffers) {
            self.shared.metrics.connections_active.dec();
            self.load.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        tracing::debug!(
            worker = self.index,
            connections = self.connections.len(),
            "worker draining"
        );

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            if let Some(conn) = self.connections.get_mut(&token) {
                let result = conn.begin_drain(&self.shared.metrics);
                self.apply(token, result);
            }
        }
    }

    fn abort_all(&mut self) {
        if !self.connections.is_empty() {
            tracing::warn!(
                worker = self.index,
                connections = self.connections.len(),
                "forcing connections closed"
            );
        }
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, CloseMode::Abort);
        }
    }
}
