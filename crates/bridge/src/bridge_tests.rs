// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use super::*;
use crate::backend::{AdapterCapabilities, Availability, BackendAdapter, BackendOptions, BackendSession};
use crate::consumer::{InboundConsumerMessage, OutboundFrame};
use crate::gatekeeper::{Gatekeeper, Identity, Role};
use crate::storage::InMemoryStorage;
use crate::tracer::{NoopMetrics, TracingTracer};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// A backend double that records outbound `send()` calls; its inbound
/// message stream is always empty (tests that need backend-originated
/// traffic drive it directly through `SessionBridge::handle_backend_message`).
struct MockSession {
    // Held for the session's lifetime so its consumption task's stream never
    // ends on its own; tests that need backend-originated traffic drive it
    // directly through `SessionBridge::handle_backend_message` instead.
    _tx_to_bridge: mpsc::Sender<UnifiedMessage>,
    rx_to_bridge: std::sync::Mutex<Option<mpsc::Receiver<UnifiedMessage>>>,
    sent: Arc<std::sync::Mutex<Vec<UnifiedMessage>>>,
    closed: Arc<AtomicBool>,
}

impl BackendSession for MockSession {
    fn session_id(&self) -> &str {
        "mock"
    }

    fn send(&self, msg: UnifiedMessage) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>> {
        self.sent.lock().expect("mutex poisoned").push(msg);
        Box::pin(async { Ok(()) })
    }

    fn messages(&mut self) -> mpsc::Receiver<UnifiedMessage> {
        self.rx_to_bridge.lock().expect("mutex poisoned").take().expect("messages() called twice")
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async {})
    }
}

struct MockAdapter {
    sent: Arc<std::sync::Mutex<Vec<UnifiedMessage>>>,
    closed: Arc<AtomicBool>,
}

impl MockAdapter {
    fn new() -> (Self, Arc<std::sync::Mutex<Vec<UnifiedMessage>>>, Arc<AtomicBool>) {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        (Self { sent: Arc::clone(&sent), closed: Arc::clone(&closed) }, sent, closed)
    }
}

impl BackendAdapter for MockAdapter {
    fn connect(
        &self,
        _options: BackendOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BackendSession>, BridgeError>> + Send>> {
        let (tx, rx) = mpsc::channel(32);
        let session = MockSession {
            _tx_to_bridge: tx,
            rx_to_bridge: std::sync::Mutex::new(Some(rx)),
            sent: Arc::clone(&self.sent),
            closed: Arc::clone(&self.closed),
        };
        Box::pin(async move { Ok(Box::new(session) as Box<dyn BackendSession>) })
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

fn build_bridge() -> (Arc<SessionBridge>, Arc<std::sync::Mutex<Vec<UnifiedMessage>>>) {
    let (adapter, sent, _closed) = MockAdapter::new();
    let gatekeeper = Arc::new(Gatekeeper::new(None));
    let bridge = SessionBridge::new(
        Box::new(adapter),
        gatekeeper,
        Box::new(InMemoryStorage::new()),
        Box::new(TracingTracer),
        Box::new(NoopMetrics),
    );
    (bridge, sent)
}

async fn connected_session(bridge: &Arc<SessionBridge>, session_id: &str) {
    bridge
        .connect_backend(session_id, BackendOptions { session_id: session_id.to_owned(), ..Default::default() })
        .await
        .expect("connect_backend should succeed against the mock adapter");
}

fn participant(id: &str) -> Identity {
    Identity { id: id.to_owned(), role: Role::Participant, display_name: None }
}

fn observer(id: &str) -> Identity {
    Identity { id: id.to_owned(), role: Role::Observer, display_name: None }
}

async fn register(bridge: &Arc<SessionBridge>, session_id: &str, identity: Identity) -> (Arc<ConsumerHandle>, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel(16);
    let options = BackendOptions { session_id: session_id.to_owned(), ..Default::default() };
    let handle = bridge.register_consumer(session_id, identity, tx, None, options).await;
    (handle, rx)
}

#[tokio::test]
async fn register_consumer_sends_identity_and_history_before_presence() {
    let (bridge, _sent) = build_bridge();
    let (_handle, mut rx) = register(&bridge, "s1", participant("c1")).await;

    let first = timeout(RECV_TIMEOUT, rx.recv()).await.expect("recv").expect("frame");
    assert!(matches!(first, OutboundFrame::Gateway(GatewayEvent::Identity { .. })));

    let second = timeout(RECV_TIMEOUT, rx.recv()).await.expect("recv").expect("frame");
    assert!(matches!(second, OutboundFrame::Gateway(GatewayEvent::MessageHistory { .. })));

    let third = timeout(RECV_TIMEOUT, rx.recv()).await.expect("recv").expect("frame");
    assert!(matches!(third, OutboundFrame::Gateway(GatewayEvent::PresenceUpdate { .. })));
}

#[tokio::test]
async fn second_consumer_sees_first_in_presence_update() {
    let (bridge, _sent) = build_bridge();
    let (_h1, mut rx1) = register(&bridge, "s1", participant("c1")).await;
    // drain c1's own identity/history/presence frames, plus the backend
    // auto-connect's cli_connected (c1 is the first consumer in this session)
    for _ in 0..4 {
        let _ = timeout(RECV_TIMEOUT, rx1.recv()).await;
    }

    let (_h2, _rx2) = register(&bridge, "s1", participant("c2")).await;

    let presence = timeout(RECV_TIMEOUT, rx1.recv()).await.expect("recv").expect("frame");
    match presence {
        OutboundFrame::Gateway(GatewayEvent::PresenceUpdate { consumers }) => {
            assert_eq!(consumers.len(), 2);
        }
        other => panic!("expected presence_update, got {other:?}"),
    }
}

#[tokio::test]
async fn observer_cannot_send_user_message() {
    let (bridge, _sent) = build_bridge();
    let (handle, _rx) = register(&bridge, "s1", observer("viewer")).await;

    let result = bridge
        .route_consumer_message("s1", &handle, InboundConsumerMessage::UserMessage { content: "hi".into(), images: vec![] })
        .await;

    assert!(result.is_err());
    assert_eq!(result.unwrap_err().code, crate::error::ErrorCode::Unauthorized);
}

#[tokio::test]
async fn participant_user_message_is_echoed_before_backend_ack() {
    let (bridge, sent) = build_bridge();
    connected_session(&bridge, "s1").await;
    let (handle, mut rx) = register(&bridge, "s1", participant("c1")).await;
    for _ in 0..3 {
        let _ = timeout(RECV_TIMEOUT, rx.recv()).await;
    }

    bridge
        .route_consumer_message("s1", &handle, InboundConsumerMessage::UserMessage { content: "hello".into(), images: vec![] })
        .await
        .expect("route should succeed");

    let echoed = timeout(RECV_TIMEOUT, rx.recv()).await.expect("recv").expect("frame");
    match echoed {
        OutboundFrame::Message(msg) => {
            assert_eq!(msg.kind, MessageType::UserMessage);
            assert_eq!(msg.plain_text(), "hello");
        }
        other => panic!("expected a UnifiedMessage echo, got {other:?}"),
    }

    assert_eq!(sent.lock().expect("mutex poisoned").len(), 1);
}

#[tokio::test]
async fn slash_command_echo_becomes_slash_command_result() {
    let (bridge, _sent) = build_bridge();
    connected_session(&bridge, "s1").await;
    let (handle, mut rx) = register(&bridge, "s1", participant("c1")).await;
    for _ in 0..3 {
        let _ = timeout(RECV_TIMEOUT, rx.recv()).await;
    }

    bridge
        .route_consumer_message(
            "s1",
            &handle,
            InboundConsumerMessage::UserMessage { content: "/compact".into(), images: vec![] },
        )
        .await
        .expect("route should succeed");
    // optimistic echo of the slash-command user message itself
    let _ = timeout(RECV_TIMEOUT, rx.recv()).await.expect("recv").expect("frame");

    let runtime = bridge.get_or_create_session("s1").await;
    {
        let pending = runtime.pending_slash_command.lock().expect("mutex poisoned").clone();
        assert!(pending.is_some(), "pending_slash_command should be armed for a '/' prefixed message");
    }

    let reply = UnifiedMessage::new(MessageType::Assistant, crate::message::Role::Assistant).with_text("compacted");
    bridge.handle_backend_message(&runtime, reply).await;

    let transformed = timeout(RECV_TIMEOUT, rx.recv()).await.expect("recv").expect("frame");
    match transformed {
        OutboundFrame::Message(msg) => {
            assert_eq!(msg.kind, MessageType::SlashCommandResult);
            assert_eq!(msg.meta_str("command"), Some("/compact"));
        }
        other => panic!("expected slash_command_result, got {other:?}"),
    }
}

#[tokio::test]
async fn first_turn_completed_emitted_once_on_result() {
    let (bridge, _sent) = build_bridge();
    let runtime = bridge.get_or_create_session("s1").await;
    let mut events = bridge.subscribe_events();

    let user_msg = UnifiedMessage::new(MessageType::UserMessage, crate::message::Role::User).with_text("do the thing");
    bridge.handle_backend_message(&runtime, user_msg).await;

    let result_msg = UnifiedMessage::new(MessageType::Result, crate::message::Role::Assistant);
    bridge.handle_backend_message(&runtime, result_msg.clone()).await;
    bridge.handle_backend_message(&runtime, result_msg).await;

    let mut saw_first_turn = 0;
    while let Ok(Ok(event)) = timeout(RECV_TIMEOUT, events.recv()).await {
        if let BridgeEvent::SessionFirstTurnCompleted { first_user_message, .. } = event {
            saw_first_turn += 1;
            assert_eq!(first_user_message, "do the thing");
        }
    }
    assert_eq!(saw_first_turn, 1, "session:first_turn_completed must fire exactly once");
}

#[tokio::test]
async fn update_queued_message_rejects_non_owner() {
    let (bridge, _sent) = build_bridge();
    let (owner, _rx1) = register(&bridge, "s1", participant("owner")).await;
    let (other, _rx2) = register(&bridge, "s1", participant("other")).await;

    bridge
        .route_consumer_message("s1", &owner, InboundConsumerMessage::QueueMessage { content: "queued".into(), images: vec![] })
        .await
        .expect("queue should succeed");

    let result = bridge
        .route_consumer_message(
            "s1",
            &other,
            InboundConsumerMessage::UpdateQueuedMessage { content: "hijacked".into(), images: vec![] },
        )
        .await;

    assert!(result.is_err());
    assert_eq!(result.unwrap_err().code, crate::error::ErrorCode::Unauthorized);
}

#[tokio::test]
async fn unregister_consumer_drops_rate_limiter_and_updates_presence() {
    let (bridge, _sent) = build_bridge();
    let (handle, mut rx) = register(&bridge, "s1", participant("c1")).await;
    for _ in 0..3 {
        let _ = timeout(RECV_TIMEOUT, rx.recv()).await;
    }
    bridge.gatekeeper().create_rate_limiter(&handle.id);

    bridge.unregister_consumer("s1", &handle.id, 1000, "normal").await;

    let runtime = bridge.get_or_create_session("s1").await;
    assert_eq!(runtime.consumer_count().await, 0);
}

#[tokio::test]
async fn push_history_truncates_to_cap_preserving_tail() {
    let (bridge, _sent) = build_bridge();
    let bridge = bridge.with_limits(5, DEFAULT_OUTBOUND_QUEUE_CAPACITY);
    let runtime = bridge.get_or_create_session("s1").await;

    for i in 0..12 {
        let msg = UnifiedMessage::new(MessageType::UserMessage, crate::message::Role::User)
            .with_text(format!("msg-{i}"));
        bridge.push_history(&runtime, msg).await;
    }

    let history = runtime.history.read().await.clone();
    assert_eq!(history.len(), 5, "history must be capped at history_cap");
    let texts: Vec<String> = history.iter().map(UnifiedMessage::plain_text).collect();
    assert_eq!(
        texts,
        vec!["msg-7".to_owned(), "msg-8".to_owned(), "msg-9".to_owned(), "msg-10".to_owned(), "msg-11".to_owned()],
        "the preserved tail must equal the last `cap` messages appended"
    );
}
