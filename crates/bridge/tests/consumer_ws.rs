// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consumer WebSocket integration tests against a real in-process axum
//! server, mirroring the teacher's `ws_integration.rs` helper shape
//! (`crates/mux/tests/ws_integration.rs`): connect with `tokio-tungstenite`,
//! send/receive JSON frames with a timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use session_bridge::backend::{AdapterCapabilities, Availability, BackendAdapter, BackendOptions, BackendSession};
use session_bridge::bridge::SessionBridge;
use session_bridge::error::BridgeError;
use session_bridge::gatekeeper::Gatekeeper;
use session_bridge::message::UnifiedMessage;
use session_bridge::storage::InMemoryStorage;
use session_bridge::tracer::{NoopMetrics, TracingTracer};
use session_bridge::transport::{build_router, AppState};

/// Holds its sender alive for as long as the session lives, so the
/// consumption loop the bridge spawns on connect never sees a closed stream
/// and the reconnect-backoff machinery stays quiet during these tests.
struct EmptyBackendSession {
    _tx: mpsc::Sender<UnifiedMessage>,
    rx: Option<mpsc::Receiver<UnifiedMessage>>,
}

impl EmptyBackendSession {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { _tx: tx, rx: Some(rx) }
    }
}

impl BackendSession for EmptyBackendSession {
    fn session_id(&self) -> &str {
        "test"
    }

    fn send(&self, _msg: UnifiedMessage) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>> {
        Box::pin(async { Ok(()) })
    }

    fn messages(&mut self) -> mpsc::Receiver<UnifiedMessage> {
        self.rx.take().expect("messages() called once per session")
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

struct EmptyBackendAdapter;

impl BackendAdapter for EmptyBackendAdapter {
    fn connect(
        &self,
        _options: BackendOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BackendSession>, BridgeError>> + Send>> {
        Box::pin(async { Ok(Box::new(EmptyBackendSession::new()) as Box<dyn BackendSession>) })
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Local,
            teams: false,
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsTx = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsRx = futures_util::stream::SplitStream<WsStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn ws_send(tx: &mut WsTx, value: &Value) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    tx.send(WsMessage::Text(text.into())).await.map_err(|e| anyhow::anyhow!("ws send: {e}"))?;
    Ok(())
}

async fn ws_recv(rx: &mut WsRx) -> anyhow::Result<Value> {
    let msg = tokio::time::timeout(RECV_TIMEOUT, rx.next())
        .await
        .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
        .ok_or_else(|| anyhow::anyhow!("ws stream closed"))?
        .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;
    match msg {
        WsMessage::Text(text) => Ok(serde_json::from_str(&text)?),
        other => anyhow::bail!("expected Text message, got {other:?}"),
    }
}

async fn spawn_server() -> anyhow::Result<(std::net::SocketAddr, Arc<SessionBridge>)> {
    let bridge = SessionBridge::new(
        Box::new(EmptyBackendAdapter),
        Arc::new(Gatekeeper::new(None)),
        Box::new(InMemoryStorage::new()),
        Box::new(TracingTracer),
        Box::new(NoopMetrics),
    );
    let state = AppState { bridge: Arc::clone(&bridge), max_frame_bytes: 256 * 1024 };
    let router = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    // give the listener a beat to start accepting
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok((addr, bridge))
}

async fn connect(addr: &std::net::SocketAddr, session_id: &str, query: &str) -> anyhow::Result<(WsTx, WsRx)> {
    let url = if query.is_empty() {
        format!("ws://{addr}/ws/consumer/{session_id}")
    } else {
        format!("ws://{addr}/ws/consumer/{session_id}?{query}")
    };
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| anyhow::anyhow!("ws connect: {e}"))?;
    Ok(stream.split())
}

#[tokio::test]
async fn connecting_consumer_receives_identity_then_history_then_presence() -> anyhow::Result<()> {
    let (addr, _bridge) = spawn_server().await?;
    let (_tx, mut rx) = connect(&addr, "s1", "consumer_id=alice").await?;

    let identity = ws_recv(&mut rx).await?;
    assert_eq!(identity["type"], "identity");
    assert_eq!(identity["consumer_id"], "alice");

    let history = ws_recv(&mut rx).await?;
    assert_eq!(history["type"], "message_history");

    let presence = ws_recv(&mut rx).await?;
    assert_eq!(presence["type"], "presence_update");

    Ok(())
}

#[tokio::test]
async fn user_message_is_echoed_back_to_sender() -> anyhow::Result<()> {
    let (addr, _bridge) = spawn_server().await?;
    let (mut tx, mut rx) = connect(&addr, "s2", "consumer_id=bob").await?;

    // identity, history, presence, plus the backend auto-connect's cli_connected
    for _ in 0..4 {
        let _ = ws_recv(&mut rx).await?;
    }

    ws_send(&mut tx, &serde_json::json!({"type": "user_message", "content": "hello there"})).await?;

    let echoed = ws_recv(&mut rx).await?;
    assert_eq!(echoed["type"], "user_message");
    assert_eq!(echoed["content"][0]["text"], "hello there");

    Ok(())
}

#[tokio::test]
async fn second_consumer_triggers_presence_update_for_first() -> anyhow::Result<()> {
    let (addr, _bridge) = spawn_server().await?;
    let (_tx1, mut rx1) = connect(&addr, "s3", "consumer_id=alice").await?;
    // identity, history, presence, plus the backend auto-connect's cli_connected
    for _ in 0..4 {
        let _ = ws_recv(&mut rx1).await?;
    }

    let (_tx2, _rx2) = connect(&addr, "s3", "consumer_id=bob").await?;

    let presence = ws_recv(&mut rx1).await?;
    assert_eq!(presence["type"], "presence_update");
    let consumers = presence["consumers"].as_array().expect("consumers array");
    assert_eq!(consumers.len(), 2);

    Ok(())
}

#[tokio::test]
async fn oversized_frame_is_rejected_with_too_large_error() -> anyhow::Result<()> {
    let (addr, _bridge) = spawn_server().await?;
    let (mut tx, mut rx) = connect(&addr, "s4", "consumer_id=alice").await?;
    // identity, history, presence, plus the backend auto-connect's cli_connected
    for _ in 0..4 {
        let _ = ws_recv(&mut rx).await?;
    }

    let huge_content = "x".repeat(300 * 1024);
    ws_send(&mut tx, &serde_json::json!({"type": "user_message", "content": huge_content})).await?;

    let error = ws_recv(&mut rx).await?;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "TOO_LARGE");

    Ok(())
}
