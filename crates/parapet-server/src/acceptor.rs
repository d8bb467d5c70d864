//! Acceptor: binds the listening socket and hands accepted connections to
//! I/O workers.
//!
//! The acceptor runs on its own thread with its own `Poll`. When it is
//! stopped the listener is dropped, so later connection attempts are refused
//! by the OS. It can also turn SIGINT/SIGTERM (Ctrl+C on Windows) into a
//! shutdown request.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Balance;
use crate::error::{ServerError, ServerResult};
use crate::metrics::ServerMetrics;
use crate::server::ShutdownHandle;
use crate::worker::{WorkerCommand, WorkerLink};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
#[cfg(unix)]
const SIGNAL_TOKEN: Token = Token(2);

const MAX_EVENTS: usize = 256;

/// Pause before accepting again after a resource error such as `EMFILE`.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What the accept loop does after `accept` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// The backlog is empty.
    Drained,
    /// Only this connection is lost; keep accepting.
    Skip,
    /// Out of descriptors or memory; retry after [`ACCEPT_BACKOFF`].
    Backoff,
}

fn classify_accept_error(error: &io::Error) -> AcceptFailure {
    match error.kind() {
        io::ErrorKind::WouldBlock => AcceptFailure::Drained,
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::PermissionDenied => AcceptFailure::Skip,
        _ => AcceptFailure::Backoff,
    }
}

/// Binds a non-blocking listening socket with an explicit backlog.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> ServerResult<std::net::TcpListener> {
    let bind_failed = |source: io::Error| ServerError::BindFailed { addr, source };

    let backlog = i32::try_from(backlog)
        .map_err(|_| ServerError::InvalidConfig(format!("backlog {backlog} is too large")))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_failed)?;
    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.listen(backlog).map_err(bind_failed)?;

    Ok(socket.into())
}

/// Picks the worker for the next connection.
///
/// `cursor` rotates on every call so least-loaded ties are spread too.
pub fn select_worker(balance: Balance, loads: &[usize], cursor: &mut usize) -> usize {
    debug_assert!(!loads.is_empty(), "no workers to select from");
    let count = loads.len();
    let start = *cursor % count;
    *cursor = cursor.wrapping_add(1);

    match balance {
        Balance::RoundRobin => start,
        Balance::LeastLoaded => (0..count)
            .map(|offset| (start + offset) % count)
            .min_by_key(|&index| loads[index])
            .unwrap_or(start),
    }
}

/// Handle to a running acceptor thread.
#[derive(Debug)]
pub struct AcceptorHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AcceptorHandle {
    /// Stops accepting, closes the listener and joins the thread.
    ///
    /// Safe to call multiple times.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            tracing::error!(error = %e, "failed to wake acceptor");
        }
        if thread.join().is_err() {
            tracing::error!("acceptor thread panicked");
        }
    }
}

/// The accept loop.
pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    workers: Vec<WorkerLink>,
    balance: Balance,
    cursor: usize,
    metrics: ServerMetrics,
    stop: Arc<AtomicBool>,
    /// Set while queued connections wait out [`ACCEPT_BACKOFF`]; the
    /// edge-triggered listener will not report them again.
    backoff: bool,
    #[cfg(unix)]
    signals: Option<(signal_hook_mio::v1_0::Signals, ShutdownHandle)>,
}

impl Acceptor {
    /// Spawns the acceptor thread over an already bound listener.
    ///
    /// With `signal_target` set, SIGINT and SIGTERM trigger it.
    pub fn spawn(
        listener: std::net::TcpListener,
        workers: Vec<WorkerLink>,
        balance: Balance,
        metrics: ServerMetrics,
        signal_target: Option<ShutdownHandle>,
    ) -> ServerResult<AcceptorHandle> {
        if workers.is_empty() {
            return Err(ServerError::InvalidConfig(
                "acceptor needs at least one worker".to_string(),
            ));
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        #[cfg(unix)]
        let signals = match signal_target {
            Some(target) => {
                use signal_hook::consts::{SIGINT, SIGTERM};
                let mut signals = signal_hook_mio::v1_0::Signals::new([SIGINT, SIGTERM])?;
                poll.registry()
                    .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
                Some((signals, target))
            }
            None => None,
        };
        #[cfg(windows)]
        if let Some(target) = signal_target {
            // Only one console handler may exist per process.
            if let Err(e) = ctrlc::set_handler(move || target.trigger()) {
                tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            }
        }
        #[cfg(not(any(unix, windows)))]
        if signal_target.is_some() {
            tracing::warn!("signal handling is not supported on this platform");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let acceptor = Self {
            poll,
            listener,
            workers,
            balance,
            cursor: 0,
            metrics,
            stop: Arc::clone(&stop),
            backoff: false,
            #[cfg(unix)]
            signals,
        };

        let thread = thread::Builder::new()
            .name("parapet-acceptor".to_string())
            .spawn(move || acceptor.run())
            .map_err(|source| ServerError::Spawn {
                what: "acceptor".to_string(),
                source,
            })?;

        Ok(AcceptorHandle {
            stop,
            waker,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        let addr = self.listener.local_addr().ok();
        tracing::debug!(?addr, workers = self.workers.len(), "acceptor started");
        let mut events = Events::with_capacity(MAX_EVENTS);

        while !self.stop.load(Ordering::Acquire) {
            let timeout = self.backoff.then_some(ACCEPT_BACKOFF);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "acceptor poll failed");
                break;
            }

            if self.backoff {
                self.backoff = false;
                self.accept_ready();
            }

            for event in &events {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    #[cfg(unix)]
                    SIGNAL_TOKEN => self.signal_ready(),
                    _ => {}
                }
            }
        }

        let _ = self.poll.registry().deregister(&mut self.listener);
        tracing::debug!(?addr, "acceptor stopped, listener closed");
    }

    fn accept_ready(&mut self) {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) => match classify_accept_error(&e) {
                    AcceptFailure::Drained => return,
                    AcceptFailure::Skip => {
                        tracing::debug!(error = %e, "accept failed for one connection");
                    }
                    AcceptFailure::Backoff => {
                        tracing::warn!(
                            error = %e,
                            backoff_ms = ACCEPT_BACKOFF.as_millis(),
                            "accept failed, pausing"
                        );
                        self.backoff = true;
                        return;
                    }
                },
            }
        }
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let loads: Vec<usize> = self.workers.iter().map(WorkerLink::load).collect();
        let index = select_worker(self.balance, &loads, &mut self.cursor);
        let worker = &self.workers[index];

        worker.assign();
        if worker
            .mailbox()
            .deliver(WorkerCommand::Register { stream, peer })
        {
            self.metrics.connections_accepted.inc();
            tracing::debug!(%peer, worker = index, "connection accepted");
        } else {
            worker.release();
            tracing::warn!(%peer, worker = index, "worker gone, dropping connection");
        }
    }

    #[cfg(unix)]
    fn signal_ready(&mut self) {
        let Some((signals, target)) = self.signals.as_mut() else {
            return;
        };
        for signal in signals.pending() {
            tracing::info!(signal, "shutdown signal received");
            target.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream as StdTcpStream;

    use test_case::test_case;

    use super::*;

    #[test_case(Balance::RoundRobin, &[5, 0, 0], &[0, 1, 2, 0] ; "round robin ignores load")]
    #[test_case(Balance::LeastLoaded, &[5, 0, 3], &[1, 1, 1, 1] ; "least loaded picks the emptiest")]
    #[test_case(Balance::LeastLoaded, &[2, 2, 2], &[0, 1, 2, 0] ; "least loaded ties rotate")]
    fn worker_selection(balance: Balance, loads: &[usize], expected: &[usize]) {
        let mut cursor = 0;
        let picked: Vec<usize> = expected
            .iter()
            .map(|_| select_worker(balance, loads, &mut cursor))
            .collect();
        assert_eq!(picked, expected);
    }

    #[test_case(io::ErrorKind::WouldBlock, AcceptFailure::Drained ; "empty backlog")]
    #[test_case(io::ErrorKind::Interrupted, AcceptFailure::Skip ; "interrupted")]
    #[test_case(io::ErrorKind::ConnectionAborted, AcceptFailure::Skip ; "aborted before accept")]
    #[test_case(io::ErrorKind::ConnectionReset, AcceptFailure::Skip ; "reset before accept")]
    #[test_case(io::ErrorKind::OutOfMemory, AcceptFailure::Backoff ; "out of memory")]
    fn accept_error_handling(kind: io::ErrorKind, expected: AcceptFailure) {
        assert_eq!(classify_accept_error(&io::Error::from(kind)), expected);
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_backs_off() {
        // EMFILE has no dedicated ErrorKind.
        let emfile = io::Error::from_raw_os_error(24);
        assert_eq!(classify_accept_error(&emfile), AcceptFailure::Backoff);
    }

    #[test]
    fn bind_reports_address_in_use() {
        let first = bind_listener("127.0.0.1:0".parse().expect("addr"), 16).expect("bind");
        let addr = first.local_addr().expect("local addr");

        // SO_REUSEADDR does not allow two live listeners on one port.
        let err = bind_listener(addr, 16).expect_err("port taken");
        assert!(matches!(err, ServerError::BindFailed { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn bound_listener_accepts_connections() {
        let listener = bind_listener("127.0.0.1:0".parse().expect("addr"), 16).expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let _client = StdTcpStream::connect(addr).expect("connect succeeds while listening");
    }
}
