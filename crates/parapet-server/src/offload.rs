//! Bounded worker pool for CPU-heavy work taken off the I/O threads.
//!
//! Used for TLS handshake steps. A task carries its own completion path (a
//! worker mailbox), so the pool knows nothing about connections.
//!
//! # Lifecycle
//!
//! 1. Create with `OffloadPool::start(config)`; threads are spawned eagerly.
//! 2. Hand [`OffloadSubmitter`] clones to the I/O workers.
//! 3. Call `shutdown()` once every submitter is gone to join the threads.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::error::{ServerError, ServerResult};

/// Configuration for the offload pool.
#[derive(Debug, Clone, Copy)]
pub struct OffloadConfig {
    /// Number of pool threads.
    pub worker_count: usize,
    /// Capacity of the shared task queue.
    pub queue_capacity: usize,
}

/// A unit of work for the pool.
pub struct OffloadTask(Box<dyn FnOnce() + Send + 'static>);

impl OffloadTask {
    pub fn new(work: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(work))
    }

    /// Runs the task on the calling thread.
    pub fn run_inline(self) {
        (self.0)();
    }
}

impl fmt::Debug for OffloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OffloadTask")
    }
}

/// The queue was full or the pool has stopped. The task is handed back.
#[derive(Debug)]
pub struct Saturated(pub OffloadTask);

/// Cloneable handle used by I/O workers to enqueue tasks.
#[derive(Clone)]
pub struct OffloadSubmitter {
    tx: Sender<OffloadTask>,
}

impl OffloadSubmitter {
    /// Enqueues `task` without blocking.
    pub fn submit(&self, task: OffloadTask) -> Result<(), Saturated> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task) | TrySendError::Disconnected(task)) => {
                Err(Saturated(task))
            }
        }
    }

    /// Number of tasks waiting for a thread.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

impl fmt::Debug for OffloadSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadSubmitter")
            .field("queued", &self.queued())
            .finish()
    }
}

/// Fixed set of threads draining a bounded task queue.
pub struct OffloadPool {
    submitter: Option<OffloadSubmitter>,
    handles: Vec<Option<thread::JoinHandle<()>>>,
}

impl OffloadPool {
    /// Spawns the pool threads.
    ///
    /// Failure to spawn any thread is fatal; threads already started are
    /// stopped before the error is returned.
    pub fn start(config: OffloadConfig) -> ServerResult<Self> {
        if config.worker_count == 0 || config.queue_capacity == 0 {
            return Err(ServerError::InvalidConfig(
                "offload pool needs at least one thread and queue slot".to_string(),
            ));
        }

        let (tx, rx) = crossbeam_channel::bounded(config.queue_capacity);
        let mut pool = Self {
            submitter: Some(OffloadSubmitter { tx }),
            handles: Vec::with_capacity(config.worker_count),
        };

        for index in 0..config.worker_count {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("parapet-offload-{index}"))
                .spawn(move || Self::worker_loop(index, &rx));
            match spawned {
                Ok(handle) => pool.handles.push(Some(handle)),
                Err(source) => {
                    pool.shutdown();
                    return Err(ServerError::Spawn {
                        what: format!("offload thread {index}"),
                        source,
                    });
                }
            }
        }

        tracing::debug!(
            threads = config.worker_count,
            capacity = config.queue_capacity,
            "offload pool started"
        );
        Ok(pool)
    }

    fn worker_loop(index: usize, rx: &Receiver<OffloadTask>) {
        // Exits once every sender is dropped and the queue is empty.
        while let Ok(task) = rx.recv() {
            if panic::catch_unwind(AssertUnwindSafe(|| task.run_inline())).is_err() {
                tracing::error!(thread = index, "offload task panicked");
            }
        }
    }

    /// Returns a handle for submitting tasks, or `None` after shutdown.
    pub fn submitter(&self) -> Option<OffloadSubmitter> {
        self.submitter.clone()
    }

    /// Number of pool threads still running.
    pub fn thread_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_some()).count()
    }

    /// Closes the queue and joins the threads. Queued tasks still run.
    ///
    /// Blocks until every outstanding [`OffloadSubmitter`] is dropped. Safe to
    /// call multiple times.
    pub fn shutdown(&mut self) {
        self.submitter = None;
        for handle in &mut self.handles {
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
        self.handles.clear();
    }
}

impl Drop for OffloadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
