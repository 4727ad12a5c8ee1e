//! Units of work flowing through the worker pool.
//!
//! A [`QueueEntry`] is created by `WorkerPool::enqueue` and consumed by
//! whichever worker pops it first. The requester keeps the matching
//! [`ChunkTicket`], a future that resolves exactly once with a
//! [`ChunkOutcome`].

use chunkstream_core::{
    Error,
    types::{ChunkCoordinates, ChunkData, GenerationConfig, RequestId},
};
use core::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A successfully generated chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub coords: ChunkCoordinates,
    pub chunk: ChunkData,
    /// Milliseconds spent inside the generator, excluding queue wait.
    pub generation_ms: f64,
}

/// How a request left the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Completed(ChunkResult),
    Failed(Error),
    /// The cancellation token fired before the result could be delivered, or
    /// the pool shut down while the request was still queued.
    Cancelled,
}

/// Write side of a request's result, settled at most once.
#[derive(Debug)]
pub(crate) struct ResultSink(Option<oneshot::Sender<ChunkOutcome>>);

impl ResultSink {
    /// Delivers `outcome` unless the sink was already settled. Returns whether
    /// this call settled it. A requester that stopped listening is not an
    /// error.
    pub(crate) fn settle(&mut self, outcome: ChunkOutcome) -> bool {
        match self.0.take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) const fn is_settled(&self) -> bool {
        self.0.is_none()
    }
}

/// A request waiting in the FIFO queue.
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub(crate) request_id: RequestId,
    pub(crate) coords: ChunkCoordinates,
    pub(crate) config: GenerationConfig,
    pub(crate) cancel: CancellationToken,
    pub(crate) sink: ResultSink,
}

impl QueueEntry {
    pub(crate) fn new(
        request_id: RequestId,
        coords: ChunkCoordinates,
        config: GenerationConfig,
        cancel: CancellationToken,
    ) -> (Self, ChunkTicket) {
        let (tx, rx) = oneshot::channel();
        let ticket = ChunkTicket {
            request_id: request_id.clone(),
            rx,
        };
        let entry = Self {
            request_id,
            coords,
            config,
            cancel,
            sink: ResultSink(Some(tx)),
        };
        (entry, ticket)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The requester's handle on an enqueued chunk.
///
/// Resolves exactly once. If the pool is torn down without settling the
/// request, the ticket resolves to [`Error::ServiceShutdown`].
#[derive(Debug)]
#[must_use = "a ticket does nothing unless awaited"]
pub struct ChunkTicket {
    request_id: RequestId,
    rx: oneshot::Receiver<ChunkOutcome>,
}

impl ChunkTicket {
    /// The request this ticket settles.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for ChunkTicket {
    type Output = ChunkOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(ChunkOutcome::Failed(Error::ServiceShutdown)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> (QueueEntry, ChunkTicket) {
        QueueEntry::new(
            "r1".to_string(),
            ChunkCoordinates::new(0, 0),
            GenerationConfig::new(json!({})),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn settles_once() {
        let (mut entry, ticket) = entry();
        assert_eq!(ticket.request_id(), "r1");
        assert!(entry.sink.settle(ChunkOutcome::Cancelled));
        assert!(entry.sink.is_settled());
        assert!(!entry.sink.settle(ChunkOutcome::Failed(Error::ServiceShutdown)));
        assert_eq!(ticket.await, ChunkOutcome::Cancelled);
    }

    #[tokio::test]
    async fn dropped_entry_resolves_as_shutdown() {
        let (entry, ticket) = entry();
        drop(entry);
        assert_eq!(ticket.await, ChunkOutcome::Failed(Error::ServiceShutdown));
    }

    #[test]
    fn reports_cancellation() {
        let (entry, _ticket) = entry();
        assert!(!entry.is_cancelled());
        entry.cancel.cancel();
        assert!(entry.is_cancelled());
    }
}
