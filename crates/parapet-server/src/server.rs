//! Server controller: startup, steady state and coordinated shutdown.
//!
//! ```text
//! INIT ──bind()──→ BOUND ──start()──→ RUNNING ──shutdown()──→ DRAINING ──→ STOPPED
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rustls::ServerConfig as RustlsServerConfig;

use crate::acceptor::{Acceptor, AcceptorHandle, bind_listener};
use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::connection::PipelineLimits;
use crate::error::{ServerError, ServerResult};
use crate::handler::{Handler, SharedHandler};
use crate::metrics::ServerMetrics;
use crate::offload::{OffloadConfig, OffloadPool};
use crate::tls::{SelfSignedCertificate, build_server_config};
use crate::worker::{IoWorker, WorkerCommand, WorkerHandle, WorkerShared};

/// Idle buffers retained per I/O worker.
const BUFFERS_PER_WORKER: usize = 256;

/// Lifecycle state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Bound,
    Running,
    Draining,
    Stopped,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Bound => "bound",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Handle for requesting a shutdown from any thread.
///
/// Waiting blocks on a condition variable, never a busy loop.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until [`Self::trigger`] is called.
    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let mut triggered = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*triggered {
            triggered = cvar.wait(triggered).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until triggered or `timeout` elapses. Returns whether it was
    /// triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (triggered, _) = cvar
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        *triggered
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Outcome of [`Server::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every worker drained before the timeout.
    pub graceful: bool,
    pub workers_drained: usize,
    /// Workers whose remaining connections were forced closed.
    pub workers_aborted: usize,
}

impl ShutdownReport {
    fn nothing_running() -> Self {
        Self {
            graceful: true,
            workers_drained: 0,
            workers_aborted: 0,
        }
    }
}

/// Threads owned by a running server.
struct Runtime {
    acceptor: AcceptorHandle,
    workers: Vec<WorkerHandle>,
    worker_done: Receiver<usize>,
    offload: OffloadPool,
}

/// The TLS-terminating HTTP/1.1 server.
pub struct Server {
    config: Arc<ServerConfig>,
    state: ServerState,
    certificate: SelfSignedCertificate,
    tls_config: Arc<RustlsServerConfig>,
    handler: SharedHandler,
    metrics: ServerMetrics,
    shutdown_signal: ShutdownHandle,
    handle_signals: bool,
    listener: Option<std::net::TcpListener>,
    local_addr: Option<SocketAddr>,
    runtime: Option<Runtime>,
}

impl Server {
    /// Validates `config`, generates the ephemeral certificate and builds the
    /// TLS configuration. Nothing is bound yet.
    pub fn new(config: ServerConfig, handler: impl Handler) -> ServerResult<Self> {
        config.validate()?;

        let certificate = SelfSignedCertificate::generate(&config.subject_alt_names)?;
        let tls_config = build_server_config(config.tls_engine, &certificate)?;
        tracing::debug!(engine = %config.tls_engine, "TLS configuration built");

        Ok(Self {
            config: Arc::new(config),
            state: ServerState::Init,
            certificate,
            tls_config,
            handler: Arc::new(handler),
            metrics: ServerMetrics::new()?,
            shutdown_signal: ShutdownHandle::new(),
            handle_signals: false,
            listener: None,
            local_addr: None,
            runtime: None,
        })
    }

    /// Like [`Self::new`], with SIGINT/SIGTERM triggering shutdown once
    /// running.
    pub fn with_signal_handling(config: ServerConfig, handler: impl Handler) -> ServerResult<Self> {
        let mut server = Self::new(config, handler)?;
        server.handle_signals = true;
        Ok(server)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The certificate presented to clients.
    pub fn certificate(&self) -> &SelfSignedCertificate {
        &self.certificate
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Bound address, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns a handle that can request shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown_signal.clone()
    }

    /// Binds the listening socket with the configured backlog.
    pub fn bind(&mut self) -> ServerResult<SocketAddr> {
        self.expect_state(ServerState::Init)?;

        let listener = bind_listener(self.config.bind_addr, self.config.backlog)?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        self.local_addr = Some(addr);
        self.state = ServerState::Bound;

        tracing::info!(%addr, backlog = self.config.backlog, "server bound");
        Ok(addr)
    }

    /// Spawns the offload pool, the I/O workers and the acceptor.
    ///
    /// Binds first when called in the `Init` state.
    pub fn start(&mut self) -> ServerResult<()> {
        if self.state == ServerState::Init {
            self.bind()?;
        }
        self.expect_state(ServerState::Bound)?;

        let listener = self.listener.take().ok_or(ServerError::InvalidState {
            expected: "bound",
            actual: "unbound",
        })?;
        let runtime = self.spawn_runtime(listener)?;
        self.runtime = Some(runtime);
        self.state = ServerState::Running;

        tracing::info!(
            addr = ?self.local_addr,
            engine = %self.config.tls_engine,
            io_workers = self.config.io_workers,
            handshake_workers = self.config.handshake_workers,
            "server running"
        );
        Ok(())
    }

    fn spawn_runtime(&self, listener: std::net::TcpListener) -> ServerResult<Runtime> {
        let config = &self.config;
        let mut offload = OffloadPool::start(OffloadConfig {
            worker_count: config.handshake_workers,
            queue_capacity: config.handshake_queue_capacity,
        })?;
        let submitter = offload.submitter().ok_or(ServerError::InvalidState {
            expected: "running offload pool",
            actual: "stopped offload pool",
        })?;

        let shared = WorkerShared {
            tls_config: Arc::clone(&self.tls_config),
            handler: Arc::clone(&self.handler),
            limits: PipelineLimits {
                max_head_size: config.max_head_size,
                max_message_size: config.max_message_size,
            },
            buffers: Arc::new(BufferPool::new(
                config.io_workers.saturating_mul(BUFFERS_PER_WORKER),
                config.read_buffer_size,
                config.max_pooled_buffer_size,
            )),
            metrics: self.metrics.clone(),
        };

        let (done_tx, worker_done) = crossbeam_channel::unbounded();
        let mut workers: Vec<WorkerHandle> = Vec::with_capacity(config.io_workers);
        for index in 0..config.io_workers {
            match IoWorker::spawn(index, shared.clone(), submitter.clone(), done_tx.clone()) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    abort_workers(&mut workers);
                    drop(submitter);
                    offload.shutdown();
                    return Err(e);
                }
            }
        }
        drop(submitter);

        let links = workers.iter().map(|w| w.link().clone()).collect();
        let signal_target = self.handle_signals.then(|| self.shutdown_signal.clone());
        let acceptor = match Acceptor::spawn(
            listener,
            links,
            config.balance,
            self.metrics.clone(),
            signal_target,
        ) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                abort_workers(&mut workers);
                offload.shutdown();
                return Err(e);
            }
        };

        Ok(Runtime {
            acceptor,
            workers,
            worker_done,
            offload,
        })
    }

    /// Drains and stops the server.
    ///
    /// The acceptor stops first, so new connections are refused. Workers
    /// then finish in-flight exchanges; any still busy when the shutdown
    /// timeout elapses have their connections forced closed. Calling this on
    /// a stopped server does nothing.
    pub fn shutdown(&mut self) -> ServerResult<ShutdownReport> {
        match self.state {
            ServerState::Stopped => return Ok(ShutdownReport::nothing_running()),
            ServerState::Init | ServerState::Bound => {
                self.listener = None;
                self.state = ServerState::Stopped;
                self.shutdown_signal.trigger();
                tracing::info!("server stopped before running");
                return Ok(ShutdownReport::nothing_running());
            }
            ServerState::Running | ServerState::Draining => {}
        }

        self.state = ServerState::Draining;
        self.shutdown_signal.trigger();
        tracing::info!(timeout = ?self.config.shutdown_timeout, "server draining");

        let Some(mut runtime) = self.runtime.take() else {
            self.state = ServerState::Stopped;
            return Ok(ShutdownReport::nothing_running());
        };

        runtime.acceptor.stop();
        for worker in &runtime.workers {
            worker.link().mailbox().deliver(WorkerCommand::Drain);
        }

        let total = runtime.workers.len();
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut drained = 0;
        while drained < total {
            match runtime.worker_done.recv_deadline(deadline) {
                Ok(_) => drained += 1,
                Err(_) => break,
            }
        }

        let aborted = total - drained;
        if aborted > 0 {
            tracing::warn!(
                workers = aborted,
                active = self.metrics.connections_active.get(),
                "shutdown timeout elapsed, forcing remaining connections closed"
            );
            for worker in &runtime.workers {
                worker.link().mailbox().deliver(WorkerCommand::Abort);
            }
        }

        for worker in &mut runtime.workers {
            worker.join();
        }
        runtime.offload.shutdown();

        self.state = ServerState::Stopped;
        let report = ShutdownReport {
            graceful: aborted == 0,
            workers_drained: drained,
            workers_aborted: aborted,
        };
        tracing::info!(
            graceful = report.graceful,
            drained = report.workers_drained,
            aborted = report.workers_aborted,
            "server stopped"
        );
        Ok(report)
    }

    /// Starts (if needed), blocks until a shutdown is requested, then shuts
    /// down.
    pub fn run(mut self) -> ServerResult<ShutdownReport> {
        if matches!(self.state, ServerState::Init | ServerState::Bound) {
            self.start()?;
        }
        self.expect_state(ServerState::Running)?;

        self.shutdown_signal.wait();
        self.shutdown()
    }

    fn expect_state(&self, expected: ServerState) -> ServerResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ServerError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.state == ServerState::Running {
            let _ = self.shutdown();
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("local_addr", &self.local_addr)
            .field("engine", &self.config.tls_engine)
            .finish_non_exhaustive()
    }
}

fn abort_workers(workers: &mut [WorkerHandle]) {
    for worker in workers.iter() {
        worker.link().mailbox().deliver(WorkerCommand::Abort);
    }
    for worker in workers.iter_mut() {
        worker.join();
    }
}
