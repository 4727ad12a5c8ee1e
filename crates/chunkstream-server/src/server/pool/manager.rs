//! Shared worker pool for chunk generation.
//!
//! This module defines the [`WorkerPool`] struct, which owns a fixed set of
//! long-lived worker tasks serving one FIFO queue. Every connection submits
//! into the same queue, so `max_workers` bounds generation across the whole
//! process, not per client.
//!
//! ## Lifecycle of a request
//!
//! `QUEUED -> RUNNING -> {SETTLED | CANCELLED}`
//!
//! - Cancelling a queued request costs nothing: the entry stays in place and
//!   is dropped when a worker reaches it (or when a saturated queue is
//!   purged), so `queue_size` may count a few dead entries.
//! - Cancelling a running request only suppresses delivery. The generator is
//!   not preempted and the worker slot is released when it returns.
//!
//! Enqueueing never waits for a worker. The queue is capped by
//! `max_queue_depth` and overflow is reported as [`Error::PoolSaturated`].

use crate::server::{
    generation::ChunkGenerator,
    pool::{
        request::{ChunkOutcome, ChunkTicket, QueueEntry},
        worker::worker_loop,
    },
};
use chunkstream_core::{
    Error, Result,
    types::{ChunkCoordinates, GenerationConfig, PoolStats, RequestId},
};
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};
use std::{collections::VecDeque, sync::Arc};
use tokio::{sync::Notify, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// Sizing and timing knobs for a [`WorkerPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Number of chunks generated concurrently.
    pub max_workers: usize,
    /// Upper bound on entries waiting in the queue.
    pub max_queue_depth: usize,
    /// Report a running generation as failed after this long.
    pub generation_timeout: Option<Duration>,
    /// How long `shutdown` waits for each worker.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            max_queue_depth: 4096,
            generation_timeout: None,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

/// State shared between the pool handle and its workers.
///
/// The queue mutex is the only lock. Counters are atomics so that
/// [`WorkerPool::stats`] never contends with dispatch.
pub(crate) struct PoolShared {
    queue: Mutex<VecDeque<QueueEntry>>,
    work_ready: Notify,
    pub(crate) generator: Arc<dyn ChunkGenerator>,
    pub(crate) generation_timeout: Option<Duration>,
    max_workers: usize,
    max_queue_depth: usize,
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    pub(crate) shutdown_token: CancellationToken,
}

impl PoolShared {
    /// Waits until a live entry is available and claims it.
    ///
    /// The claimed entry is already counted as active when this returns.
    /// Cancel-safe: nothing is popped across an await point.
    pub(crate) async fn next_entry(&self) -> QueueEntry {
        loop {
            let notified = self.work_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.pop_live() {
                return entry;
            }

            notified.await;
        }
    }

    fn pop_live(&self) -> Option<QueueEntry> {
        let mut queue = self.queue.lock();

        let mut live = None;
        while let Some(mut entry) = queue.pop_front() {
            if entry.is_cancelled() {
                #[cfg(feature = "tracing")]
                tracing::trace!("Dropping cancelled request {}", entry.request_id);
                entry.sink.settle(ChunkOutcome::Cancelled);
                continue;
            }
            live = Some(entry);
            break;
        }

        self.queued.store(queue.len(), Ordering::Relaxed);
        if live.is_some() {
            self.active.fetch_add(1, Ordering::Relaxed);
        }
        let more = !queue.is_empty();
        drop(queue);

        // Chain the wake-up so idle workers drain a backlog in parallel.
        if more {
            self.work_ready.notify_one();
        }

        live
    }

    pub(crate) fn release_worker(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A bounded pool of workers executing the chunk generator.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `config.max_workers` worker tasks on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(generator: Arc<dyn ChunkGenerator>, config: PoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Notify::new(),
            generator,
            generation_timeout: config.generation_timeout,
            max_workers,
            max_queue_depth: config.max_queue_depth.max(1),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            shutdown_token: CancellationToken::new(),
        });

        let workers = (0..max_workers)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, Arc::clone(&shared))))
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Queues one chunk for generation and returns a ticket for its outcome.
    ///
    /// Never waits for a worker. The ticket resolves to
    /// [`ChunkOutcome::Cancelled`] if `cancel` fires before the result is
    /// delivered.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`WorkerPool::shutdown`] has started.
    /// - [`Error::PoolSaturated`] if the queue is full of live entries.
    pub fn enqueue(
        &self,
        request_id: RequestId,
        coords: ChunkCoordinates,
        config: GenerationConfig,
        cancel: CancellationToken,
    ) -> Result<ChunkTicket> {
        let mut queue = self.shared.queue.lock();

        // Checked under the lock so it cannot race the shutdown drain.
        if self.shared.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        if queue.len() >= self.shared.max_queue_depth {
            let _purged = purge_cancelled(&mut queue);
            #[cfg(feature = "tracing")]
            tracing::debug!("Queue at capacity, purged {_purged} cancelled entries");

            if queue.len() >= self.shared.max_queue_depth {
                self.shared.queued.store(queue.len(), Ordering::Relaxed);
                return Err(Error::PoolSaturated {
                    capacity: self.shared.max_queue_depth,
                });
            }
        }

        let (entry, ticket) = QueueEntry::new(request_id, coords, config, cancel);
        queue.push_back(entry);
        self.shared.queued.store(queue.len(), Ordering::Relaxed);
        drop(queue);

        self.shared.work_ready.notify_one();
        Ok(ticket)
    }

    /// A point-in-time snapshot of the pool. Never blocks.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_size: self.shared.queued.load(Ordering::Relaxed),
            active_workers: self.shared.active.load(Ordering::Relaxed),
            max_workers: self.shared.max_workers,
            total_completed: self.shared.completed.load(Ordering::Relaxed),
            total_failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown_token.is_cancelled()
    }

    /// Gracefully shuts down the pool.
    ///
    /// - Refuses new requests.
    /// - Settles every queued request as cancelled.
    /// - Lets running generations finish, waiting up to `shutdown_timeout`
    ///   per worker.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the service shutdown path.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 1: Stop accepting new requests and drain the queue ===
        let drained: Vec<QueueEntry> = {
            let mut queue = self.shared.queue.lock();
            self.shared.shutdown_token.cancel();
            self.shared.queued.store(0, Ordering::Relaxed);
            queue.drain(..).collect()
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Refusing new chunk requests, cancelling {} queued",
            drained.len()
        );

        for mut entry in drained {
            entry.sink.settle(ChunkOutcome::Cancelled);
        }

        // === Phase 2: Wait for workers to finish their current chunk ===
        let handles = core::mem::take(&mut *self.workers.lock());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Waiting up to {:?} per worker for {} workers",
            self.shutdown_timeout,
            handles.len()
        );

        let waits = handles
            .into_iter()
            .enumerate()
            .map(|(_i, handle)| async move {
                match timeout(self.shutdown_timeout, handle).await {
                    Ok(Ok(())) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!("Worker {_i} stopped");
                    }
                    Ok(Err(_e)) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!("Worker {_i} failed: {_e}");
                    }
                    Err(_) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Worker {_i} shutdown timed out");
                    }
                }
            });

        futures::future::join_all(waits).await;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");

        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown_token.cancel();
    }
}

/// Removes entries whose tokens already fired, settling them as cancelled.
fn purge_cancelled(queue: &mut VecDeque<QueueEntry>) -> usize {
    let before = queue.len();
    queue.retain_mut(|entry| {
        if entry.is_cancelled() {
            entry.sink.settle(ChunkOutcome::Cancelled);
            false
        } else {
            true
        }
    });
    before - queue.len()
}
