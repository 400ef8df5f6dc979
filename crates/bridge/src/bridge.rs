// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `SessionBridge` (spec.md §4.3): the core coordinator. Owns every live
//! session, forwards consumer traffic to backends, folds backend output
//! through [`crate::reducer::reduce`], fans it out to consumers, and keeps
//! the event bus and storage collaborators informed. Grounded in the
//! teacher's `MuxState` (`crates/mux/src/state.rs`) for the top-level
//! shape and in its upstream bridge task (`crates/mux/src/upstream/bridge.rs`)
//! for the backend-consumption-loop-with-reconnect pattern.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::backend::{BackendAdapter, BackendOptions};
use crate::consumer::{
    ConsumerHandle, GatewayEvent, InboundConsumerMessage, OutboundFrame, PermissionBehavior,
    DEFAULT_OUTBOUND_QUEUE_CAPACITY,
};
use crate::error::{self, BridgeError};
use crate::event::{BridgeEvent, EventBus};
use crate::gatekeeper::{Gatekeeper, Identity};
use crate::message::{ContentBlock, MessageType, Role as MsgRole, UnifiedMessage};
use crate::reducer::reduce;
use crate::session::{epoch_ms, PendingPermission, QueuedMessage, SessionRuntime};
use crate::state::SessionStatus;
use crate::storage::{SessionSnapshot, Storage};
use crate::tracer::{Metrics, Tracer};

/// Default inline history cap for newly-joining consumers; older entries
/// are dropped once the cap is reached (spec.md §6, matching the size cap
/// `Storage`'s `SessionSnapshot` documents). Overridable via
/// [`SessionBridge::with_limits`].
const DEFAULT_HISTORY_CAP: usize = 2000;

pub struct SessionBridge {
    sessions: RwLock<HashMap<String, Arc<SessionRuntime>>>,
    adapter: Box<dyn BackendAdapter>,
    gatekeeper: Arc<Gatekeeper>,
    events: EventBus,
    storage: Box<dyn Storage>,
    tracer: Box<dyn Tracer>,
    metrics: Box<dyn Metrics>,
    outbound_queue_capacity: usize,
    history_cap: usize,
}

impl SessionBridge {
    pub fn new(
        adapter: Box<dyn BackendAdapter>,
        gatekeeper: Arc<Gatekeeper>,
        storage: Box<dyn Storage>,
        tracer: Box<dyn Tracer>,
        metrics: Box<dyn Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            adapter,
            gatekeeper,
            events: EventBus::default(),
            storage,
            tracer,
            metrics,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            history_cap: DEFAULT_HISTORY_CAP,
        })
    }

    /// Override the default history cap and outbound queue capacity before
    /// the bridge starts serving (spec.md §9 "config is passed in explicitly
    /// at construction"). Must be called before wrapping in `Arc` is of any
    /// use elsewhere, so it consumes and returns `Arc<Self>` via `Arc::get_mut`
    /// on a freshly-constructed, not-yet-shared bridge.
    pub fn with_limits(mut self: Arc<Self>, history_cap: usize, outbound_queue_capacity: usize) -> Arc<Self> {
        if let Some(inner) = Arc::get_mut(&mut self) {
            inner.history_cap = history_cap;
            inner.outbound_queue_capacity = outbound_queue_capacity;
        }
        self
    }

    pub fn gatekeeper(&self) -> &Arc<Gatekeeper> {
        &self.gatekeeper
    }

    pub fn outbound_queue_capacity(&self) -> usize {
        self.outbound_queue_capacity
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    // -- Session lifecycle ------------------------------------------------

    pub async fn get_or_create_session(&self, session_id: &str) -> Arc<SessionRuntime> {
        if let Some(existing) = self.sessions.read().await.get(session_id) {
            return Arc::clone(existing);
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(
            sessions.entry(session_id.to_owned()).or_insert_with(|| Arc::new(SessionRuntime::new(session_id))),
        )
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<SessionRuntime>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Connect (or reuse) a session's backend process (spec.md §4.2, §4.3).
    pub async fn connect_backend(
        self: &Arc<Self>,
        session_id: &str,
        options: BackendOptions,
    ) -> Result<(), BridgeError> {
        let runtime = self.get_or_create_session(session_id).await;
        if runtime.has_backend().await {
            return Ok(());
        }

        let mut session = self.adapter.connect(options).await?;
        let rx = session.messages();
        *runtime.backend.lock().await = Some(session);
        runtime.backoff.lock().expect("backoff mutex poisoned").reset();

        self.tracer.event(session_id, "backend_connected", "");
        self.events.emit(BridgeEvent::BackendConnected { session_id: session_id.to_owned() });
        self.events.emit(BridgeEvent::CliConnected { session_id: session_id.to_owned() });
        self.metrics.incr("bridge.backend.connected");

        self.broadcast_to_consumers(&runtime, OutboundFrame::Gateway(GatewayEvent::CliConnected {})).await;
        self.spawn_consumption_task(Arc::clone(&runtime), rx);
        Ok(())
    }

    fn spawn_consumption_task(
        self: &Arc<Self>,
        runtime: Arc<SessionRuntime>,
        mut rx: mpsc::Receiver<UnifiedMessage>,
    ) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                bridge.handle_backend_message(&runtime, msg).await;
            }
            bridge.handle_backend_stream_ended(&runtime).await;
        });
    }

    async fn handle_backend_message(self: &Arc<Self>, runtime: &Arc<SessionRuntime>, msg: UnifiedMessage) {
        {
            let mut state = runtime.state.write().await;
            *state = reduce(state.clone(), &msg);
        }
        let msg = self.maybe_passthrough_slash_command(runtime, msg);

        match msg.kind {
            MessageType::PermissionRequest => {
                if let Some(request_id) = msg.meta_str("request_id").map(str::to_owned) {
                    let pending = PendingPermission {
                        request_id: request_id.clone(),
                        tool_name: msg.meta_str("tool_name").map(str::to_owned),
                        options: msg
                            .metadata
                            .get("options")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default(),
                        requested_at: epoch_ms(),
                    };
                    runtime.pending_permissions.write().await.insert(request_id.clone(), pending);
                    self.events.emit(BridgeEvent::PermissionRequested {
                        session_id: runtime.id.clone(),
                        request_id,
                    });
                }
            }
            MessageType::ControlResponse => {
                if let Some(id) = msg.meta_str("request_id").map(str::to_owned) {
                    let waiter = runtime.pending_control_requests.lock().expect("mutex poisoned").remove(&id);
                    let response = msg.metadata.get("response").cloned().unwrap_or(Value::Null);
                    if let Some(tx) = waiter {
                        let _ = tx.send(response.clone());
                        self.events.emit(BridgeEvent::CapabilitiesReady {
                            session_id: runtime.id.clone(),
                            request_id: id,
                            response: response.clone(),
                        });
                        self.broadcast_to_consumers(
                            runtime,
                            OutboundFrame::Gateway(GatewayEvent::CapabilitiesReady {
                                request_id: id,
                                response,
                            }),
                        )
                        .await;
                        return;
                    }
                }
            }
            MessageType::AuthStatus => {
                self.events.emit(BridgeEvent::AuthStatus {
                    session_id: runtime.id.clone(),
                    description: msg.meta_str("description").map(str::to_owned),
                });
            }
            MessageType::SessionInit => {
                if let Some(backend_session_id) = msg.meta_str("backend_session_id").map(str::to_owned) {
                    self.events.emit(BridgeEvent::BackendSessionId {
                        session_id: runtime.id.clone(),
                        backend_session_id,
                    });
                }
                self.spawn_capabilities_request(runtime);
            }
            MessageType::SessionUpdate => {
                if let Some(backend_session_id) = msg.meta_str("backend_session_id").map(str::to_owned) {
                    self.events.emit(BridgeEvent::BackendSessionId {
                        session_id: runtime.id.clone(),
                        backend_session_id,
                    });
                }
            }
            MessageType::Error if msg.meta_str("source") == Some("stderr") => {
                let line = msg.meta_str("line").unwrap_or_default().to_owned();
                self.broadcast_to_consumers(runtime, OutboundFrame::Gateway(GatewayEvent::ProcessOutput { line }))
                    .await;
                return;
            }
            MessageType::Error => {
                self.events.emit(BridgeEvent::Error {
                    session_id: Some(runtime.id.clone()),
                    source: "backend",
                    message: msg.plain_text(),
                });
            }
            _ => {}
        }

        if msg.kind == MessageType::Result {
            self.maybe_emit_first_turn_completed(runtime, &msg).await;
        }

        self.push_history(runtime, msg.clone()).await;
        self.events.emit(BridgeEvent::MessageOutbound {
            session_id: runtime.id.clone(),
            kind: msg.kind.as_str(),
        });
        self.broadcast_to_consumers(runtime, OutboundFrame::Message(msg)).await;
        self.persist(runtime).await;
        self.maybe_flush_queued_message(runtime).await;
    }

    /// Emit `session:first_turn_completed` the first time a non-error
    /// `result` lands for this session (spec.md §8 Scenario A step 8).
    async fn maybe_emit_first_turn_completed(&self, runtime: &Arc<SessionRuntime>, msg: &UnifiedMessage) {
        let is_error = msg.metadata.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        if is_error {
            return;
        }
        if runtime.first_turn_completed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let first_user_message = runtime
            .history
            .read()
            .await
            .iter()
            .find(|m| m.kind == MessageType::UserMessage)
            .map(UnifiedMessage::plain_text)
            .unwrap_or_default();
        self.events.emit(BridgeEvent::SessionFirstTurnCompleted {
            session_id: runtime.id.clone(),
            first_user_message,
        });
    }

    /// Convert an echoed turn completion into `slash_command_result` when the
    /// triggering user message was a slash command (spec.md §9 "Passthrough
    /// echoes", §8 Scenario E). Adapters that lack an echo hook simply never
    /// arm `pending_slash_command`, so this is a no-op for them.
    fn maybe_passthrough_slash_command(&self, runtime: &Arc<SessionRuntime>, msg: UnifiedMessage) -> UnifiedMessage {
        if msg.kind != MessageType::Assistant {
            return msg;
        }
        let pending = runtime.pending_slash_command.lock().expect("mutex poisoned").take();
        let Some((request_id, command)) = pending else { return msg };
        UnifiedMessage::new(MessageType::SlashCommandResult, MsgRole::System)
            .with_meta("command", command)
            .with_meta("request_id", request_id)
            .with_meta("source", "cli")
            .with_meta("content", msg.plain_text())
    }

    /// Kick off the capabilities handshake in the background (spec.md §4.4:
    /// "On session_init arriving from the backend, the bridge generates a
    /// request id and calls backendSession.sendRaw(...)"). Awaiting
    /// `request_capabilities` inline here would deadlock: its response is a
    /// later `ControlResponse` drained by this same consumption loop, which
    /// won't read the next message until this call returns.
    fn spawn_capabilities_request(self: &Arc<Self>, runtime: &Arc<SessionRuntime>) {
        let bridge = Arc::clone(self);
        let session_id = runtime.id.clone();
        tokio::spawn(async move {
            if let Err(err) = bridge.request_capabilities(&session_id).await {
                bridge.tracer.event(&session_id, "capabilities_request_failed", &err.message);
            }
        });
    }

    /// Backend's message stream ended — cancel pending permissions, tell
    /// consumers the CLI disconnected, then reconnect with backoff rather
    /// than closing the session outright (spec.md §4.4, §5, §8 property 4,
    /// property 10, Scenario C).
    async fn handle_backend_stream_ended(self: &Arc<Self>, runtime: &Arc<SessionRuntime>) {
        *runtime.backend.lock().await = None;
        self.cancel_all_pending_permissions(runtime).await;

        self.events.emit(BridgeEvent::BackendDisconnected {
            session_id: runtime.id.clone(),
            code: 1000,
            reason: "stream ended".to_owned(),
        });
        self.events.emit(BridgeEvent::CliDisconnected {
            session_id: runtime.id.clone(),
            code: 1000,
            reason: "stream ended".to_owned(),
        });
        self.metrics.incr("bridge.backend.disconnected");
        self.broadcast_to_consumers(
            runtime,
            OutboundFrame::Gateway(GatewayEvent::CliDisconnected { code: 1000, reason: "stream ended".to_owned() }),
        )
        .await;

        if runtime.cancel.is_cancelled() {
            return;
        }

        let delay_ms = runtime.backoff.lock().expect("backoff mutex poisoned").next_delay_ms();
        let bridge = Arc::clone(self);
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            if runtime.cancel.is_cancelled() {
                return;
            }
            let options = BackendOptions {
                session_id: runtime.id.clone(),
                resume_backend_session_id: runtime.state.read().await.backend_session_id.clone(),
                ..Default::default()
            };
            if let Err(err) = bridge.connect_backend(&runtime.id, options).await {
                bridge.tracer.event(&runtime.id, "reconnect_failed", &err.message);
            }
        });
    }

    /// Close a session permanently: tears down the backend, kicks every
    /// consumer, and removes it from the registry.
    pub async fn close_session(&self, session_id: &str) {
        let Some(runtime) = self.sessions.write().await.remove(session_id) else {
            return;
        };
        runtime.cancel.cancel();

        if let Some(backend) = runtime.backend.lock().await.take() {
            backend.close().await;
        }
        for (_, consumer) in runtime.consumers.write().await.drain() {
            consumer.kick.cancel();
        }
        self.events.emit(BridgeEvent::SessionClosed { session_id: session_id.to_owned() });
    }

    // -- History / persistence --------------------------------------------

    async fn push_history(&self, runtime: &Arc<SessionRuntime>, msg: UnifiedMessage) {
        let mut history = runtime.history.write().await;
        history.push(msg);
        if history.len() > self.history_cap {
            let excess = history.len() - self.history_cap;
            history.drain(0..excess);
        }
    }

    async fn persist(&self, runtime: &Arc<SessionRuntime>) {
        let snapshot = SessionSnapshot {
            id: runtime.id.clone(),
            backend_session_id: runtime.state.read().await.backend_session_id.clone(),
            cwd: runtime.state.read().await.cwd.clone(),
            created_at: runtime.created_at,
            name: runtime.name.read().await.clone(),
            state: runtime.state.read().await.clone(),
            history: runtime.history.read().await.clone(),
        };
        // Storage failures are logged but never interrupt the session
        // (spec.md §7).
        if let Err(err) = self.storage.save(snapshot).await {
            self.tracer.event(&runtime.id, "storage_save_failed", &err.message);
        }
    }

    // -- Consumers ----------------------------------------------------------

    /// Register a connecting consumer's channel (the transport layer creates
    /// the `mpsc` pair so it can hold the receiver half for its write loop).
    /// Sends `identity` and `message_history` directly to the new consumer
    /// while still holding the consumer-set write lock, so no concurrently
    /// broadcast message can land ahead of them; `presence_update` then goes
    /// out to everyone, including the new consumer (spec.md §4.5 "open").
    pub async fn register_consumer(
        self: &Arc<Self>,
        session_id: &str,
        identity: Identity,
        tx: mpsc::Sender<OutboundFrame>,
        encryption: Option<Arc<crate::encryption::EncryptionLayer>>,
        backend_options: BackendOptions,
    ) -> Arc<ConsumerHandle> {
        let runtime = self.get_or_create_session(session_id).await;
        let handle = Arc::new(ConsumerHandle {
            id: identity.id.clone(),
            identity: identity.clone(),
            tx,
            encryption,
            kick: tokio_util::sync::CancellationToken::new(),
        });

        {
            let mut consumers = runtime.consumers.write().await;
            consumers.insert(handle.id.clone(), Arc::clone(&handle));
            let _ = handle.tx.try_send(OutboundFrame::Gateway(GatewayEvent::Identity {
                consumer_id: identity.id.clone(),
                role: identity.role,
                display_name: identity.display_name.clone(),
            }));
            let history = runtime.history.read().await.clone();
            let _ = handle.tx.try_send(OutboundFrame::Gateway(GatewayEvent::MessageHistory { messages: history }));
        }

        self.events.emit(BridgeEvent::CliConnected { session_id: session_id.to_owned() });
        self.broadcast_presence(&runtime).await;

        // A consumer joining a session with no live backend yet owns the
        // lifecycle of that session's agent subprocess (spec.md §1, §2): start
        // or reattach it now rather than leaving sendToBackend permanently
        // unavailable.
        if !runtime.has_backend().await {
            let mut options = backend_options;
            options.session_id = session_id.to_owned();
            if options.resume_backend_session_id.is_none() {
                options.resume_backend_session_id = runtime.state.read().await.backend_session_id.clone();
            }
            if let Err(err) = self.connect_backend(session_id, options).await {
                self.tracer.event(session_id, "connect_backend_failed", &err.message);
                let _ = handle.tx.try_send(OutboundFrame::Gateway(GatewayEvent::Error {
                    code: err.code.as_str().to_owned(),
                    message: err.message.clone(),
                    source: Some("backend_connect".to_owned()),
                }));
            }
        }

        handle
    }

    pub async fn unregister_consumer(&self, session_id: &str, consumer_id: &str, code: u16, reason: &str) {
        let Some(runtime) = self.session(session_id).await else { return };
        runtime.consumers.write().await.remove(consumer_id);
        self.gatekeeper.drop_rate_limiter(consumer_id);
        self.events.emit(BridgeEvent::CliDisconnected {
            session_id: session_id.to_owned(),
            code,
            reason: reason.to_owned(),
        });
        self.broadcast_presence(&runtime).await;
    }

    async fn broadcast_presence(&self, runtime: &Arc<SessionRuntime>) {
        let consumers = runtime.consumers.read().await.values().map(|c| c.presence_entry()).collect();
        self.broadcast_to_consumers(
            runtime,
            OutboundFrame::Gateway(GatewayEvent::PresenceUpdate { consumers }),
        )
        .await;
    }

    /// Fan a frame out to every connected consumer, evicting any whose
    /// outbound queue is full (spec.md §5 "slow consumer").
    async fn broadcast_to_consumers(&self, runtime: &Arc<SessionRuntime>, frame: OutboundFrame) {
        let consumers = runtime.consumers.read().await;
        let mut slow = Vec::new();
        for (id, consumer) in consumers.iter() {
            match consumer.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => slow.push(id.clone()),
                Err(mpsc::error::TrySendError::Closed(_)) => slow.push(id.clone()),
            }
        }
        drop(consumers);

        if slow.is_empty() {
            return;
        }
        let mut consumers = runtime.consumers.write().await;
        for id in slow {
            if let Some(consumer) = consumers.remove(&id) {
                consumer.kick.cancel();
                self.metrics.incr("bridge.consumer.evicted_slow");
            }
        }
    }

    // -- Inbound consumer traffic -------------------------------------------

    /// Authorize and dispatch one inbound consumer message (spec.md §4.5
    /// "receive").
    pub async fn route_consumer_message(
        self: &Arc<Self>,
        session_id: &str,
        consumer: &Arc<ConsumerHandle>,
        msg: InboundConsumerMessage,
    ) -> Result<(), BridgeError> {
        if !self.gatekeeper.authorize(&consumer.identity, msg.action_name()) {
            return Err(error::unauthorized("consumer is not a participant"));
        }
        let runtime = self.get_or_create_session(session_id).await;

        match msg {
            InboundConsumerMessage::UserMessage { content, images } => {
                self.send_user_message(&runtime, content, images).await
            }
            InboundConsumerMessage::SlashCommand { command } => {
                let unified = UnifiedMessage::new(MessageType::SlashCommand, MsgRole::User).with_text(command);
                self.echo_and_forward(&runtime, unified).await
            }
            InboundConsumerMessage::Interrupt {} => {
                let unified = UnifiedMessage::new(MessageType::Interrupt, MsgRole::System);
                self.send_to_backend(&runtime, unified).await
            }
            InboundConsumerMessage::PermissionResponse { request_id, behavior, message } => {
                runtime.pending_permissions.write().await.remove(&request_id);
                let behavior_str = match behavior {
                    PermissionBehavior::Allow => "allow",
                    PermissionBehavior::Deny => "deny",
                    PermissionBehavior::Cancelled => "cancelled",
                };
                let mut unified = UnifiedMessage::new(MessageType::PermissionResponse, MsgRole::System)
                    .with_meta("request_id", request_id.clone())
                    .with_meta("behavior", behavior_str);
                if let Some(message) = message {
                    unified = unified.with_meta("message", message);
                }
                self.events.emit(BridgeEvent::PermissionResolved {
                    session_id: session_id.to_owned(),
                    request_id,
                    behavior: behavior_str.to_owned(),
                });
                self.send_to_backend(&runtime, unified).await
            }
            InboundConsumerMessage::SetModel { model } => {
                let unified = UnifiedMessage::new(MessageType::ConfigurationChange, MsgRole::System)
                    .with_meta("field", "model")
                    .with_meta("value", model);
                self.send_to_backend(&runtime, unified).await
            }
            InboundConsumerMessage::SetPermissionMode { mode } => {
                let value = serde_json::to_value(mode).unwrap_or(Value::Null);
                let unified = UnifiedMessage::new(MessageType::ConfigurationChange, MsgRole::System)
                    .with_meta("field", "permission_mode")
                    .with_meta("value", value);
                self.send_to_backend(&runtime, unified).await
            }
            InboundConsumerMessage::SetAdapter { .. } => {
                Err(error::not_supported("switching adapters mid-session is not supported"))
            }
            InboundConsumerMessage::QueueMessage { content, images } => {
                let mut slot = runtime.queued_message.lock().expect("queue mutex poisoned");
                *slot = Some(QueuedMessage {
                    owner_consumer_id: consumer.id.clone(),
                    content: content.clone(),
                    images,
                });
                drop(slot);
                self.broadcast_to_consumers(
                    &runtime,
                    OutboundFrame::Gateway(GatewayEvent::MessageQueued {
                        consumer_id: consumer.id.clone(),
                        content,
                    }),
                )
                .await;
                Ok(())
            }
            InboundConsumerMessage::UpdateQueuedMessage { content, images } => {
                self.update_queued_message(&runtime, consumer, content, images).await
            }
            InboundConsumerMessage::CancelQueuedMessage {} => {
                self.cancel_queued_message(&runtime, consumer).await
            }
        }
    }

    async fn update_queued_message(
        &self,
        runtime: &Arc<SessionRuntime>,
        consumer: &Arc<ConsumerHandle>,
        content: String,
        images: Vec<String>,
    ) -> Result<(), BridgeError> {
        {
            let mut slot = runtime.queued_message.lock().expect("queue mutex poisoned");
            match slot.as_mut() {
                Some(existing) if existing.owner_consumer_id == consumer.id => {
                    existing.content = content.clone();
                    existing.images = images;
                }
                Some(_) => return Err(error::unauthorized("queued message belongs to another consumer")),
                None => return Err(error::parse_error("no queued message to update")),
            }
        }
        self.broadcast_to_consumers(
            runtime,
            OutboundFrame::Gateway(GatewayEvent::QueuedMessageUpdated {
                consumer_id: consumer.id.clone(),
                content,
            }),
        )
        .await;
        Ok(())
    }

    async fn cancel_queued_message(
        &self,
        runtime: &Arc<SessionRuntime>,
        consumer: &Arc<ConsumerHandle>,
    ) -> Result<(), BridgeError> {
        {
            let mut slot = runtime.queued_message.lock().expect("queue mutex poisoned");
            match slot.as_ref() {
                Some(existing) if existing.owner_consumer_id == consumer.id => {
                    *slot = None;
                }
                Some(_) => return Err(error::unauthorized("queued message belongs to another consumer")),
                None => return Ok(()),
            }
        }
        self.broadcast_to_consumers(
            runtime,
            OutboundFrame::Gateway(GatewayEvent::QueuedMessageCancelled { consumer_id: consumer.id.clone() }),
        )
        .await;
        Ok(())
    }

    /// Flush the queued message once the session returns to idle (spec.md
    /// §4.3 "queue semantics: flush-on-idle").
    async fn maybe_flush_queued_message(&self, runtime: &Arc<SessionRuntime>) {
        let is_idle = runtime.state.read().await.status == SessionStatus::Idle;
        if !is_idle {
            return;
        }
        let queued = runtime.queued_message.lock().expect("queue mutex poisoned").take();
        let Some(queued) = queued else { return };

        if self.send_user_message(runtime, queued.content, queued.images).await.is_ok() {
            self.broadcast_to_consumers(runtime, OutboundFrame::Gateway(GatewayEvent::QueuedMessageSent {}))
                .await;
        }
    }

    async fn send_user_message(
        &self,
        runtime: &Arc<SessionRuntime>,
        content: String,
        images: Vec<String>,
    ) -> Result<(), BridgeError> {
        if images.is_empty() && content.trim_start().starts_with('/') {
            let request_id = runtime.next_request_id();
            *runtime.pending_slash_command.lock().expect("mutex poisoned") =
                Some((request_id, content.trim().to_owned()));
        }

        // Optimistic-UI contract (spec.md §4.4, §9): force the session into
        // `running` on send rather than waiting for the backend's own
        // `status_change`, which only arrives with the first
        // `agent_message_chunk` and would otherwise leave a gap in the
        // consumer-facing status between send and first token.
        runtime.state.write().await.status = SessionStatus::Running;

        let mut blocks = vec![ContentBlock::Text { text: content }];
        for image in images {
            blocks.push(ContentBlock::Image { data: image, mime_type: "image/png".to_owned() });
        }
        let unified = UnifiedMessage::new(MessageType::UserMessage, MsgRole::User).with_content(blocks);
        self.echo_and_forward(runtime, unified).await
    }

    /// Optimistic echo (spec.md §4.3): the message is recorded and broadcast
    /// to consumers immediately, before the backend has acknowledged it.
    async fn echo_and_forward(
        &self,
        runtime: &Arc<SessionRuntime>,
        unified: UnifiedMessage,
    ) -> Result<(), BridgeError> {
        self.push_history(runtime, unified.clone()).await;
        self.broadcast_to_consumers(runtime, OutboundFrame::Message(unified.clone())).await;
        self.send_to_backend(runtime, unified).await
    }

    async fn send_to_backend(
        &self,
        runtime: &Arc<SessionRuntime>,
        msg: UnifiedMessage,
    ) -> Result<(), BridgeError> {
        let guard = runtime.backend.lock().await;
        match guard.as_ref() {
            Some(session) => session.send(msg).await,
            None => Err(error::backend_unavailable("no backend connected for this session")),
        }
    }

    async fn send_raw_to_backend(
        &self,
        runtime: &Arc<SessionRuntime>,
        bytes: Vec<u8>,
    ) -> Result<(), BridgeError> {
        let guard = runtime.backend.lock().await;
        match guard.as_ref() {
            Some(session) => session.send_raw(bytes).await,
            None => Err(error::backend_unavailable("no backend connected for this session")),
        }
    }

    /// Request the backend's capabilities via `control_request`/`control_response`
    /// correlation (spec.md §4.4). Issued through `sendRaw` rather than `send`,
    /// matching the spec's "bridge ... calls backendSession.sendRaw(...) with a
    /// framed control_request of subtype initialize".
    pub async fn request_capabilities(&self, session_id: &str) -> Result<Value, BridgeError> {
        let runtime = self.get_or_create_session(session_id).await;
        let request_id = runtime.next_request_id();
        let (tx, rx) = oneshot::channel();
        runtime.pending_control_requests.lock().expect("mutex poisoned").insert(request_id.clone(), tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "initialize",
            "params": {"subtype": "initialize"},
        });
        let mut bytes = serde_json::to_vec(&frame).map_err(|e| error::internal_error(e.to_string()))?;
        bytes.push(b'\n');

        if let Err(err) = self.send_raw_to_backend(&runtime, bytes).await {
            runtime.pending_control_requests.lock().expect("mutex poisoned").remove(&request_id);
            return Err(err);
        }

        rx.await.map_err(|_| error::backend_unavailable("capabilities request was dropped"))
    }

    /// Disconnect a session's backend without destroying the `SessionRuntime`
    /// (spec.md §4.4 `disconnectBackend`): close the backend, cancel every
    /// pending permission, broadcast `cli_disconnected`. Safe for unknown ids.
    pub async fn disconnect_backend(&self, session_id: &str, reason: &str) {
        let Some(runtime) = self.session(session_id).await else { return };
        if let Some(backend) = runtime.backend.lock().await.take() {
            backend.close().await;
        }
        self.cancel_all_pending_permissions(&runtime).await;

        self.events.emit(BridgeEvent::BackendDisconnected {
            session_id: session_id.to_owned(),
            code: 1000,
            reason: reason.to_owned(),
        });
        self.events.emit(BridgeEvent::CliDisconnected {
            session_id: session_id.to_owned(),
            code: 1000,
            reason: reason.to_owned(),
        });
        self.broadcast_to_consumers(
            &runtime,
            OutboundFrame::Gateway(GatewayEvent::CliDisconnected { code: 1000, reason: reason.to_owned() }),
        )
        .await;
    }

    /// Cancel every pending permission request, emitting `permission_cancelled`
    /// to consumers and `permission:resolved{behavior:cancelled}` on the bus
    /// for each (spec.md §5 "Cancellation").
    async fn cancel_all_pending_permissions(&self, runtime: &Arc<SessionRuntime>) {
        let pending: Vec<String> = runtime.pending_permissions.write().await.drain().map(|(id, _)| id).collect();
        for request_id in pending {
            self.events.emit(BridgeEvent::PermissionResolved {
                session_id: runtime.id.clone(),
                request_id: request_id.clone(),
                behavior: "cancelled".to_owned(),
            });
            let cancelled = UnifiedMessage::new(MessageType::PermissionCancelled, MsgRole::System)
                .with_meta("request_id", request_id);
            self.broadcast_to_consumers(runtime, OutboundFrame::Message(cancelled)).await;
        }
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
