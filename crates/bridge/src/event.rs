// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The internal event bus (spec.md §6 "Event bus (internal)"): a typed,
//! broadcast-based notification stream for embedders that does not carry
//! the per-consumer traffic itself — that is [`crate::consumer::OutboundFrame`]'s
//! job. Grounded in the teacher's `Aggregator` (`crates/mux/src/events.rs`),
//! which fans a tagged event enum out to subscribers over a
//! `tokio::sync::broadcast` channel.

use serde_json::Value;

/// A typed event emitted by [`crate::bridge::SessionBridge`] for embedders.
/// Named exactly after the event bus entries in spec.md §6.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    BackendConnected { session_id: String },
    BackendDisconnected { session_id: String, code: u16, reason: String },
    BackendSessionId { session_id: String, backend_session_id: String },
    CliConnected { session_id: String },
    CliDisconnected { session_id: String, code: u16, reason: String },
    CliSessionId { session_id: String, backend_session_id: String },
    SessionFirstTurnCompleted { session_id: String, first_user_message: String },
    SessionClosed { session_id: String },
    PermissionRequested { session_id: String, request_id: String },
    PermissionResolved { session_id: String, request_id: String, behavior: String },
    CapabilitiesReady { session_id: String, request_id: String, response: Value },
    MessageOutbound { session_id: String, kind: &'static str },
    AuthStatus { session_id: String, description: Option<String> },
    Error { session_id: Option<String>, source: &'static str, message: String },
}

/// Broadcast hub for [`BridgeEvent`]s. A thin wrapper so construction and
/// subscription stay in one place, mirroring the teacher's `Aggregator`.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Silently dropped if there are no subscribers, matching
    /// `broadcast::Sender::send`'s semantics — the event bus is a notification
    /// fan-out, not a durable log.
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
