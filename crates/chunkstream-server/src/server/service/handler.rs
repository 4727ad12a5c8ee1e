//! HTTP and WebSocket surface of the chunk stream service.
//!
//! This module defines [`ChunkService`], which owns the shared
//! [`WorkerPool`] and exposes it through an `axum` router:
//!
//! - `GET /ws/chunks` upgrades into a chunk stream [`Session`].
//! - `GET /stats` returns the current [`PoolStats`] as JSON.
//! - `GET /health` reports `200` while serving and `503` once shutdown began.
//!
//! Each WebSocket connection is driven by a single task that multiplexes
//! inbound frames and pool settlements with `tokio::select!`, so a session's
//! state is never shared across tasks.

use crate::server::{
    config::ServerConfig,
    generation::{ChunkGenerator, FlatChunkGenerator},
    pool::manager::WorkerPool,
    service::{
        ids::RequestIdGenerator,
        session::{Session, Settlement},
    },
    telemetry::adjust_sessions_active,
};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::Response,
    routing::get,
};
use chunkstream_core::{Result, protocol::ServerMessage, types::PoolStats};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// How long a closing session waits for outcomes the pool has yet to forward.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// The chunk generation service shared by every connection.
///
/// Cloning is cheap; all clones drive the same pool.
#[derive(Clone)]
pub struct ChunkService {
    config: ServerConfig,
    pool: Arc<WorkerPool>,
    ids: Arc<RequestIdGenerator>,
    closing: CancellationToken,
}

impl ChunkService {
    /// Creates the service backed by the built-in [`FlatChunkGenerator`].
    pub fn new(config: ServerConfig) -> Self {
        let generator = Arc::new(FlatChunkGenerator::new(config.chunk_size));
        Self::with_generator(config, generator)
    }

    /// Creates the service with a custom generator and spawns its workers.
    pub fn with_generator(config: ServerConfig, generator: Arc<dyn ChunkGenerator>) -> Self {
        let pool = WorkerPool::new(generator, config.pool_config());

        #[cfg(feature = "tracing")]
        tracing::debug!("Spawned {} chunk workers", config.max_workers);

        Self {
            config,
            pool: Arc::new(pool),
            ids: Arc::new(RequestIdGenerator::default()),
            closing: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Builds the router serving this service.
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws/chunks", get(ws_handler))
            .route("/stats", get(stats_handler))
            .route("/health", get(health_handler))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(self)
    }

    /// Shuts the pool down, then closes every open session.
    ///
    /// Requests still queued are answered with `CHUNK_CANCELLED`; requests
    /// already generating are allowed to finish first. Every accepted request
    /// gets its terminal message before its session closes; those still
    /// running past the shutdown timeout end as `CHUNK_CANCELLED`.
    ///
    /// # Errors
    ///
    /// Propagates failures from [`WorkerPool::shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.pool.shutdown().await;
        self.closing.cancel();
        result
    }

    fn session(&self) -> (Session, mpsc::UnboundedReceiver<Settlement>) {
        Session::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.ids),
            self.config.max_inflight_per_client,
        )
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(service): State<ChunkService>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, service))
}

async fn stats_handler(State(service): State<ChunkService>) -> Json<PoolStats> {
    Json(service.stats())
}

async fn health_handler(State(service): State<ChunkService>) -> (StatusCode, &'static str) {
    if service.pool.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ok")
    }
}

/// Drives one connection until the client leaves or the service closes.
async fn run_session(socket: WebSocket, service: ChunkService) {
    let (mut tx, rx) = socket.split();
    let (mut session, settlements) = service.session();
    adjust_sessions_active(1);

    #[cfg(feature = "tracing")]
    tracing::debug!("Chunk stream session opened");

    if let Err(_e) = send_message(&mut tx, &session.ready()).await {
        #[cfg(feature = "tracing")]
        tracing::debug!("Failed to send handshake: {_e:#}");
    } else {
        pump(&mut session, &mut tx, rx, settlements, &service.closing).await;
    }

    let _abandoned = session.close();

    #[cfg(feature = "tracing")]
    tracing::debug!("Chunk stream session closed, {_abandoned} requests abandoned");

    adjust_sessions_active(-1);
}

async fn pump(
    session: &mut Session,
    tx: &mut SplitSink<WebSocket, Message>,
    mut rx: SplitStream<WebSocket>,
    mut settlements: mpsc::UnboundedReceiver<Settlement>,
    closing: &CancellationToken,
) {
    loop {
        let reply = tokio::select! {
            frame = rx.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => session.handle_bytes(&bytes),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("WebSocket receive error: {_e}");
                    break;
                }
            },
            Some(settlement) = settlements.recv() => match session.settle(settlement) {
                Some(message) => message,
                None => continue,
            },
            () = closing.cancelled() => {
                if let Err(_e) = drain(session, tx, &mut settlements).await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("WebSocket send error while draining: {_e:#}");
                    return;
                }
                let _ = tx.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(_e) = send_message(tx, &reply).await {
            #[cfg(feature = "tracing")]
            tracing::debug!("WebSocket send error: {_e:#}");
            break;
        }
    }
}

/// Delivers the terminal message of every request still pending when the
/// service closes.
///
/// Outcomes already settled by the pool are forwarded as they arrive. Anything
/// still unsettled after [`DRAIN_GRACE`] is cancelled.
async fn drain(
    session: &mut Session,
    tx: &mut SplitSink<WebSocket, Message>,
    settlements: &mut mpsc::UnboundedReceiver<Settlement>,
) -> anyhow::Result<()> {
    let deadline = tokio::time::sleep(DRAIN_GRACE);
    tokio::pin!(deadline);

    while session.pending_len() > 0 {
        tokio::select! {
            settlement = settlements.recv() => match settlement {
                Some(settlement) => {
                    if let Some(message) = session.settle(settlement) {
                        send_message(tx, &message).await?;
                    }
                }
                None => break,
            },
            () = &mut deadline => break,
        }
    }

    let leftover = session.cancel_all();
    #[cfg(feature = "tracing")]
    if !leftover.is_empty() {
        tracing::debug!("Cancelled {} unsettled requests on close", leftover.len());
    }
    for message in &leftover {
        send_message(tx, message).await?;
    }
    Ok(())
}

async fn send_message(
    tx: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    tx.send(Message::Text(text.into())).await?;
    Ok(())
}
