use chunkstream_core::{
    protocol::ServerMessage,
    types::{ChunkCoordinates, ChunkData, GenerationConfig},
};
use chunkstream_server::server::{
    config::ServerConfig, generation::ChunkGenerator, service::handler::ChunkService,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Generator that holds chunk `x == 0` until the gate opens or the request is
/// cancelled.
struct Gate {
    open: AtomicBool,
    calls: AtomicUsize,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    fn generate(&self, coords: ChunkCoordinates, cancel: &CancellationToken) -> ChunkData {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while coords.x == 0
            && !self.open.load(Ordering::SeqCst)
            && !cancel.is_cancelled()
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(2));
        }
        json!({"x": coords.x, "y": coords.y})
    }
}

async fn start(gate: &Arc<Gate>) -> (ChunkService, String) {
    let gate = Arc::clone(gate);
    let generator = move |coords: ChunkCoordinates,
                          _: &GenerationConfig,
                          cancel: &CancellationToken|
          -> anyhow::Result<ChunkData> { Ok(gate.generate(coords, cancel)) };
    start_with(Arc::new(generator)).await
}

async fn start_with(generator: Arc<dyn ChunkGenerator>) -> (ChunkService, String) {
    let service = ChunkService::with_generator(
        ServerConfig {
            max_workers: 1,
            ..ServerConfig::default()
        },
        generator,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = service.clone().router();
    tokio::spawn(async move { axum::serve(listener, app).await });

    (service, format!("ws://{addr}/ws/chunks"))
}

async fn connect(url: &str) -> Client {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, value: serde_json::Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no message from server")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn request(id: &str, x: i32) -> serde_json::Value {
    json!({
        "type": "CHUNK_REQUEST",
        "requestId": id,
        "coords": {"x": x, "y": 4},
        "config": {"seed": "abc"},
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_round_trip() {
    let gate = Gate::new();
    let (_service, url) = start(&gate).await;
    let mut ws = connect(&url).await;

    match recv(&mut ws).await {
        ServerMessage::ChunkStreamReady { stats } => {
            assert_eq!(stats.max_workers, 1);
            assert_eq!(stats.queue_size, 0);
            assert_eq!(stats.active_workers, 0);
        }
        other => panic!("unexpected {other:?}"),
    }

    send(&mut ws, request("r1", 3)).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::ChunkAccepted {
            request_id: "r1".to_string(),
            queue_size: 0,
        }
    );

    match recv(&mut ws).await {
        ServerMessage::ChunkResult {
            request_id,
            coords,
            chunk,
            timings,
        } => {
            assert_eq!(request_id, "r1");
            assert_eq!(coords, ChunkCoordinates::new(3, 4));
            assert_eq!(chunk, json!({"x": 3, "y": 4}));
            assert!(timings.generation_ms >= 0.0);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_keeps_connection_open() {
    let gate = Gate::new();
    let (_service, url) = start(&gate).await;
    let mut ws = connect(&url).await;
    recv(&mut ws).await;

    ws.send(Message::text("{oops")).await.unwrap();
    assert!(matches!(
        recv(&mut ws).await,
        ServerMessage::ChunkError { request_id, .. } if request_id == "unknown"
    ));

    send(&mut ws, request("after", 1)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::ChunkAccepted { .. }));
    assert!(matches!(recv(&mut ws).await, ServerMessage::ChunkResult { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_suppresses_result() {
    let gate = Gate::new();
    let (service, url) = start(&gate).await;
    let mut ws = connect(&url).await;
    recv(&mut ws).await;

    send(&mut ws, request("blocker", 0)).await;
    recv(&mut ws).await;
    wait_until(|| service.stats().active_workers == 1).await;

    send(&mut ws, request("r2", 5)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::ChunkAccepted { .. }));

    send(&mut ws, json!({"type": "CHUNK_CANCEL", "requestId": "r2"})).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::ChunkCancelled {
            request_id: "r2".to_string()
        }
    );

    gate.open.store(true, Ordering::SeqCst);
    let result = recv(&mut ws).await;
    assert_eq!(result.request_id(), Some("blocker"));
    assert!(matches!(result, ServerMessage::ChunkResult { .. }));

    // Nothing else arrives for the cancelled request.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), ws.next())
            .await
            .is_err()
    );
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_cancels_pending_requests() {
    let gate = Gate::new();
    let (service, url) = start(&gate).await;
    let mut ws = connect(&url).await;
    recv(&mut ws).await;

    send(&mut ws, request("blocker", 0)).await;
    recv(&mut ws).await;
    wait_until(|| service.stats().active_workers == 1).await;

    for (i, id) in ["q1", "q2"].into_iter().enumerate() {
        send(&mut ws, request(id, i as i32 + 1)).await;
        assert!(matches!(recv(&mut ws).await, ServerMessage::ChunkAccepted { .. }));
    }
    assert_eq!(service.stats().queue_size, 2);

    drop(ws);

    // The blocker observes its token, and the queued pair is dropped unrun.
    wait_until(|| {
        let stats = service.stats();
        stats.active_workers == 0 && stats.queue_size == 0
    })
    .await;
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);

    // The pool keeps serving other connections.
    let mut other = connect(&url).await;
    recv(&mut other).await;
    send(&mut other, request("fresh", 7)).await;
    recv(&mut other).await;
    assert!(matches!(recv(&mut other).await, ServerMessage::ChunkResult { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_settles_every_accepted_request() {
    for _ in 0..10 {
        let slow = |coords: ChunkCoordinates,
                    _: &GenerationConfig,
                    _: &CancellationToken|
         -> anyhow::Result<ChunkData> {
            std::thread::sleep(Duration::from_millis(30));
            Ok(json!({"x": coords.x}))
        };
        let (service, url) = start_with(Arc::new(slow)).await;
        let mut ws = connect(&url).await;
        recv(&mut ws).await;

        for (x, id) in [(1, "s1"), (2, "s2")] {
            send(&mut ws, request(id, x)).await;
            assert!(matches!(recv(&mut ws).await, ServerMessage::ChunkAccepted { .. }));
        }

        service.shutdown().await.unwrap();

        // Every accepted request gets exactly one terminal message before Close.
        let mut settled = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("session never closed");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let message: ServerMessage = serde_json::from_str(text.as_str()).unwrap();
                    assert!(
                        matches!(
                            message,
                            ServerMessage::ChunkResult { .. } | ServerMessage::ChunkCancelled { .. }
                        ),
                        "unexpected {message:?}"
                    );
                    settled.push(message.request_id().unwrap().to_string());
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
        settled.sort();
        assert_eq!(settled, ["s1", "s2"]);
    }
}
