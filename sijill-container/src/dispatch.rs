//! Bounded worker pool for async listeners.
//!
//! Jobs go through a bounded `tokio::sync::mpsc` channel to a fixed set
//! of worker tasks on a private multi-thread runtime. The runtime is
//! started on first submission, so a container that never uses async
//! listeners never spawns a thread.
//!
//! When the channel is full, [`QueueFullPolicy::Block`] parks the
//! publishing thread until a slot frees up and [`QueueFullPolicy::Fail`]
//! returns [`SijillError::DispatchQueueFull`]. Blocking is impossible
//! from inside an async runtime, so there `Block` behaves like `Fail`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SijillError};
use crate::settings::{ContainerSettings, QueueFullPolicy};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// What happened to queued async work at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainOutcome {
    /// `false` when the timeout expired first.
    pub completed: bool,
    /// Jobs neither run nor discarded when the pool stopped.
    pub abandoned: usize,
    /// Jobs dropped unrun because draining was disabled.
    pub discarded: usize,
}

struct PoolInner {
    runtime: Runtime,
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

/// Counters shared with the worker tasks.
#[derive(Default)]
struct Tally {
    discard: AtomicBool,
    pending: AtomicUsize,
    discarded: AtomicUsize,
}

pub(crate) struct DispatchPool {
    workers: usize,
    capacity: usize,
    policy: QueueFullPolicy,
    inner: Mutex<Option<PoolInner>>,
    closed: AtomicBool,
    tally: Arc<Tally>,
}

impl DispatchPool {
    pub fn new(settings: &ContainerSettings) -> Self {
        Self {
            workers: settings.async_workers.max(1),
            capacity: settings.async_queue_capacity.max(1),
            policy: settings.queue_full_policy,
            inner: Mutex::new(None),
            closed: AtomicBool::new(false),
            tally: Arc::new(Tally::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queues a job.
    ///
    /// # Errors
    /// - [`SijillError::ContainerShutDown`] after [`shutdown`](Self::shutdown)
    /// - [`SijillError::DispatchQueueFull`] per the queue-full policy
    pub fn submit(&self, job: Job) -> Result<()> {
        if self.is_closed() {
            return Err(SijillError::ContainerShutDown);
        }
        let sender = self.sender()?;

        self.tally.pending.fetch_add(1, Ordering::SeqCst);
        let outcome = match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SijillError::ContainerShutDown),
            Err(TrySendError::Full(job)) => self.on_full(&sender, job),
        };
        if outcome.is_err() {
            self.tally.pending.fetch_sub(1, Ordering::SeqCst);
        }
        outcome
    }

    fn on_full(&self, sender: &mpsc::Sender<Job>, job: Job) -> Result<()> {
        let full = SijillError::DispatchQueueFull {
            capacity: self.capacity,
        };
        match self.policy {
            QueueFullPolicy::Fail => Err(full),
            QueueFullPolicy::Block if Handle::try_current().is_ok() => {
                warn!("Async queue full inside an async runtime; cannot block");
                Err(full)
            }
            QueueFullPolicy::Block => {
                debug!(capacity = self.capacity, "Async queue full, waiting");
                sender
                    .blocking_send(job)
                    .map_err(|_| SijillError::ContainerShutDown)
            }
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        let mut inner = self.inner.lock();
        if let Some(ref pool) = *inner {
            return Ok(pool.sender.clone());
        }
        if self.is_closed() {
            return Err(SijillError::ContainerShutDown);
        }

        let pool = self.start()?;
        let sender = pool.sender.clone();
        *inner = Some(pool);
        Ok(sender)
    }

    fn start(&self) -> Result<PoolInner> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.workers)
            .max_blocking_threads(self.workers)
            .thread_name("sijill-dispatch")
            .enable_all()
            .build()
            .map_err(|e| SijillError::DispatchUnavailable {
                reason: e.to_string(),
            })?;

        let (sender, receiver) = mpsc::channel::<Job>(self.capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..self.workers)
            .map(|_| {
                let receiver = receiver.clone();
                let tally = self.tally.clone();
                runtime.spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job) = next else { break };
                        if tally.discard.load(Ordering::SeqCst) {
                            tally.discarded.fetch_add(1, Ordering::SeqCst);
                        } else {
                            // Off the worker threads so the timer keeps running.
                            let _ = tokio::task::spawn_blocking(job).await;
                        }
                        tally.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        info!(workers = self.workers, capacity = self.capacity, "Async dispatch pool started");
        Ok(PoolInner {
            runtime,
            sender,
            workers,
        })
    }

    /// Stops accepting jobs, then runs (or discards) what is queued,
    /// waiting at most `timeout`.
    pub fn shutdown(&self, timeout: Duration, drain: bool) -> DrainOutcome {
        self.closed.store(true, Ordering::SeqCst);
        if !drain {
            self.tally.discard.store(true, Ordering::SeqCst);
        }

        let Some(PoolInner {
            runtime,
            sender,
            workers,
        }) = self.inner.lock().take()
        else {
            return DrainOutcome {
                completed: true,
                ..DrainOutcome::default()
            };
        };
        drop(sender);

        let completed = if Handle::try_current().is_ok() {
            warn!("Shutdown called from an async runtime; not waiting for async listeners");
            false
        } else {
            runtime.block_on(async move {
                tokio::time::timeout(timeout, async move {
                    for worker in workers {
                        let _ = worker.await;
                    }
                })
                .await
                .is_ok()
            })
        };
        runtime.shutdown_background();

        let outcome = DrainOutcome {
            completed,
            abandoned: self.tally.pending.load(Ordering::SeqCst),
            discarded: self.tally.discarded.load(Ordering::SeqCst),
        };
        if completed {
            debug!(discarded = outcome.discarded, "Async dispatch drained");
        } else {
            warn!(
                abandoned = outcome.abandoned,
                timeout_ms = timeout.as_millis() as u64,
                "Async dispatch did not drain in time"
            );
        }
        outcome
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        if let Some(pool) = self.inner.get_mut().take() {
            pool.runtime.shutdown_background();
        }
    }
}
