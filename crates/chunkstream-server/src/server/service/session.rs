//! Per-connection protocol state.
//!
//! A [`Session`] turns inbound frames into pool submissions and pool outcomes
//! into outbound [`ServerMessage`]s. It never touches the socket: the
//! transport driver feeds it frames and [`Settlement`]s from one task, so the
//! pending map is owned outright and needs no lock.
//!
//! ## Request lifecycle
//!
//! - Admitted requests get a [`CancellationToken`] stored in the pending map
//!   and a waiter task that forwards the pool outcome as a [`Settlement`].
//! - Whichever of settlement, client cancel or disconnect happens first
//!   removes the pending entry. Anything arriving later for that entry is
//!   dropped, so each request produces exactly one terminal message.

use crate::server::{
    pool::{
        manager::WorkerPool,
        request::{ChunkOutcome, ChunkResult},
    },
    service::ids::RequestIdGenerator,
    telemetry::{adjust_requests_inflight, increment_chunk_rejections, increment_chunk_requests},
};
use chunkstream_core::{
    Error,
    protocol::{ClientMessage, Rejection, ServerMessage},
    types::{ChunkCoordinates, GenerationConfig, GenerationTimings, RequestId, UNKNOWN_REQUEST_ID},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A pool outcome routed back to the session that submitted it.
#[derive(Debug)]
pub struct Settlement {
    request_id: RequestId,
    seq: u64,
    outcome: ChunkOutcome,
}

struct PendingEntry {
    cancel: CancellationToken,
    // Distinguishes a reused request id from the entry it replaced.
    seq: u64,
}

pub struct Session {
    pool: Arc<WorkerPool>,
    ids: Arc<RequestIdGenerator>,
    max_inflight: usize,
    pending: HashMap<RequestId, PendingEntry>,
    next_seq: u64,
    settlements: mpsc::UnboundedSender<Settlement>,
}

impl Session {
    /// Creates a session and the receiver its settlements arrive on.
    ///
    /// The driver must feed everything received there back through
    /// [`Session::settle`].
    pub fn new(
        pool: Arc<WorkerPool>,
        ids: Arc<RequestIdGenerator>,
        max_inflight: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Settlement>) {
        let (settlements, rx) = mpsc::unbounded_channel();
        let session = Self {
            pool,
            ids,
            max_inflight,
            pending: HashMap::new(),
            next_seq: 0,
            settlements,
        };
        (session, rx)
    }

    /// The handshake sent once the connection is established.
    pub fn ready(&self) -> ServerMessage {
        ServerMessage::ChunkStreamReady {
            stats: self.pool.stats(),
        }
    }

    /// Handles a text frame. Always yields exactly one reply.
    pub fn handle_text(&mut self, text: &str) -> ServerMessage {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(message),
            Err(rejection) => reject(rejection),
        }
    }

    /// Handles a binary frame carrying UTF-8 JSON.
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> ServerMessage {
        match ClientMessage::parse_slice(bytes) {
            Ok(message) => self.handle_message(message),
            Err(rejection) => reject(rejection),
        }
    }

    pub fn handle_message(&mut self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::ChunkRequest {
                request_id,
                coords,
                config,
            } => self.request(request_id, coords, config),
            ClientMessage::ChunkCancel { request_id } => self.cancel(request_id),
        }
    }

    fn request(
        &mut self,
        request_id: Option<RequestId>,
        coords: ChunkCoordinates,
        config: GenerationConfig,
    ) -> ServerMessage {
        increment_chunk_requests();

        if self.pending.len() >= self.max_inflight {
            let id = request_id.unwrap_or_else(|| UNKNOWN_REQUEST_ID.to_string());
            return self.refuse(id, &Error::TooManyInflight {
                limit: self.max_inflight,
            });
        }

        let request_id = match request_id {
            Some(id) if self.pending.contains_key(&id) => {
                let err = Error::DuplicateRequest {
                    request_id: id.clone(),
                };
                return self.refuse(id, &err);
            }
            Some(id) => id,
            None => self.ids.next_id(),
        };

        // Informational only; read before submitting so it reflects the
        // backlog this request joins.
        let queue_size = self.pool.stats().queue_size;
        let cancel = CancellationToken::new();

        let ticket = match self
            .pool
            .enqueue(request_id.clone(), coords, config, cancel.clone())
        {
            Ok(ticket) => ticket,
            Err(e) => return self.refuse(request_id, &e),
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending
            .insert(request_id.clone(), PendingEntry { cancel, seq });
        adjust_requests_inflight(1);

        let settlements = self.settlements.clone();
        tokio::spawn(async move {
            let request_id = ticket.request_id().to_owned();
            let outcome = ticket.await;
            // The session is gone; nobody is left to tell.
            let _ = settlements.send(Settlement {
                request_id,
                seq,
                outcome,
            });
        });

        #[cfg(feature = "tracing")]
        tracing::trace!("Accepted {request_id} for chunk {coords} behind {queue_size} queued");

        ServerMessage::ChunkAccepted {
            request_id,
            queue_size,
        }
    }

    fn cancel(&mut self, request_id: RequestId) -> ServerMessage {
        match self.pending.remove(&request_id) {
            Some(entry) => {
                entry.cancel.cancel();
                adjust_requests_inflight(-1);

                #[cfg(feature = "tracing")]
                tracing::trace!("Cancelled {request_id}");

                ServerMessage::ChunkCancelled { request_id }
            }
            None => {
                let err = Error::RequestNotFound {
                    request_id: request_id.clone(),
                };
                ServerMessage::error(request_id, &err)
            }
        }
    }

    fn refuse(&self, request_id: RequestId, error: &Error) -> ServerMessage {
        increment_chunk_rejections();

        #[cfg(feature = "tracing")]
        if error.is_admission() {
            tracing::debug!("Rejected {request_id}: {error}");
        } else {
            tracing::warn!("Rejected {request_id}: {error}");
        }

        ServerMessage::error(request_id, error)
    }

    /// Converts a pool outcome into its terminal message.
    ///
    /// Returns `None` when the request is no longer pending, i.e. it was
    /// cancelled by the client first.
    pub fn settle(&mut self, settlement: Settlement) -> Option<ServerMessage> {
        let Settlement {
            request_id,
            seq,
            outcome,
        } = settlement;

        match self.pending.get(&request_id) {
            Some(entry) if entry.seq == seq => {}
            _ => return None,
        }
        self.pending.remove(&request_id);
        adjust_requests_inflight(-1);

        let message = match outcome {
            ChunkOutcome::Completed(ChunkResult {
                coords,
                chunk,
                generation_ms,
            }) => ServerMessage::ChunkResult {
                request_id,
                coords,
                chunk,
                timings: GenerationTimings { generation_ms },
            },
            ChunkOutcome::Failed(e) => ServerMessage::error(request_id, &e),
            ChunkOutcome::Cancelled => ServerMessage::ChunkCancelled { request_id },
        };
        Some(message)
    }

    /// Number of accepted requests still waiting for a terminal message.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Cancels every outstanding request and yields the `CHUNK_CANCELLED`
    /// each one is owed. Used when the service stops before results arrive.
    pub fn cancel_all(&mut self) -> Vec<ServerMessage> {
        let ids: Vec<RequestId> = self.pending.keys().cloned().collect();
        ids.into_iter().map(|id| self.cancel(id)).collect()
    }

    /// Cancels every outstanding request. Returns how many were pending.
    pub fn close(&mut self) -> usize {
        let abandoned = self.pending.len();
        for (_, entry) in self.pending.drain() {
            entry.cancel.cancel();
        }
        if abandoned > 0 {
            adjust_requests_inflight(-(abandoned as i64));
        }
        abandoned
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn reject(rejection: Rejection) -> ServerMessage {
    #[cfg(feature = "tracing")]
    tracing::debug!("Malformed client message: {}", rejection.error);

    increment_chunk_rejections();
    rejection.into_message()
}
