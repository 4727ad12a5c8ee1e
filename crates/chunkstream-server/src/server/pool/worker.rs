use crate::server::{
    pool::{
        manager::PoolShared,
        request::{ChunkOutcome, ChunkResult, QueueEntry},
    },
    telemetry::{increment_generation_failures, record_generation_duration},
};
use chunkstream_core::Error;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinError;

/// Worker task pulling [`QueueEntry`] items off the shared queue.
///
/// Each worker runs at most one generation at a time, so the number of workers
/// is the pool's concurrency limit. The loop exits when the pool's shutdown
/// token fires, after the chunk in hand (if any) has been settled.
///
/// # Arguments
///
/// - `worker_id`: Numeric identifier for this worker (used for logs/tracing).
/// - `shared`: Queue, generator and counters shared with [`WorkerPool`].
///
/// [`WorkerPool`]: crate::server::pool::manager::WorkerPool
pub(crate) async fn worker_loop(worker_id: usize, shared: Arc<PoolShared>) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    loop {
        let entry = tokio::select! {
            biased;
            () = shared.shutdown_token.cancelled() => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");
                break;
            }
            entry = shared.next_entry() => entry,
        };

        run_entry(worker_id, &shared, entry).await;
        shared.release_worker();
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}

/// Runs the generator for one entry and settles its ticket.
///
/// The generator runs on the blocking thread pool. Only the generator call is
/// timed; queue wait is excluded. The worker slot stays occupied until the
/// generator returns, even when the request was cancelled or timed out first.
async fn run_entry(_worker_id: usize, shared: &PoolShared, entry: QueueEntry) {
    let QueueEntry {
        request_id: _request_id,
        coords,
        config,
        cancel,
        mut sink,
    } = entry;

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} generating {_request_id} at {coords}");

    let generator = Arc::clone(&shared.generator);
    let token = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let result = generator.generate(coords, &config, &token);
        (result, started.elapsed())
    });

    let deadline = async {
        match shared.generation_timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => core::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut timed_out = false;
    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            () = cancel.cancelled(), if !sink.is_settled() => {
                sink.settle(ChunkOutcome::Cancelled);
            }
            () = &mut deadline, if !sink.is_settled() => {
                let timeout_ms = shared
                    .generation_timeout
                    .map_or(0, whole_millis);

                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Worker {_worker_id}: {_request_id} exceeded {timeout_ms}ms, still holding the slot"
                );

                timed_out = true;
                shared.record_failed();
                increment_generation_failures();
                sink.settle(ChunkOutcome::Failed(Error::GenerationTimeout { timeout_ms }));
            }
        }
    };

    // A timed-out run was already counted as a failure.
    let outcome = match joined {
        Ok((Ok(chunk), elapsed)) => {
            let generation_ms = elapsed.as_secs_f64() * 1000.0;
            record_generation_duration(generation_ms);
            if !timed_out {
                shared.record_completed();
            }
            ChunkOutcome::Completed(ChunkResult {
                coords,
                chunk,
                generation_ms,
            })
        }
        Ok((Err(e), _)) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {_worker_id}: {_request_id} failed: {e:#}");

            if !timed_out {
                shared.record_failed();
                increment_generation_failures();
            }
            ChunkOutcome::Failed(Error::generation(e))
        }
        Err(join_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {_worker_id}: generator crashed on {_request_id}: {join_err}");

            if !timed_out {
                shared.record_failed();
                increment_generation_failures();
            }
            ChunkOutcome::Failed(crashed(&join_err))
        }
    };

    // No-op when cancellation or the timeout already settled the ticket. A
    // cancellation that raced the final poll still wins.
    if cancel.is_cancelled() {
        sink.settle(ChunkOutcome::Cancelled);
    } else {
        sink.settle(outcome);
    }
}

fn crashed(err: &JoinError) -> Error {
    if err.is_panic() {
        Error::generation("generator panicked")
    } else {
        Error::generation(err)
    }
}

// Saturates instead of truncating absurdly long limits.
fn whole_millis(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}
