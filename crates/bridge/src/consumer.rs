// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `ConsumerGateway` (spec.md §4.5): owns one consumer WebSocket — open,
//! authenticate, receive, close — and routes inbound traffic into
//! [`crate::bridge::SessionBridge`]. Message shapes for both directions
//! live here too, modeled as tagged sum types the way the teacher's
//! `MuxEvent` (`crates/mux/src/events.rs`) is, rather than as inheritance.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::encryption::EncryptionLayer;
use crate::error::{self, BridgeError};
use crate::gatekeeper::{Identity, Role};
use crate::message::UnifiedMessage;

/// A consumer's decision on a pending permission request (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
    Cancelled,
}

/// Inbound frames a consumer may send (spec.md §6 "Inbound ConsumerMessage
/// types"). `request_id` correlation for `permission_response` is carried on
/// the variant itself rather than out-of-band metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundConsumerMessage {
    UserMessage {
        content: String,
        #[serde(default)]
        images: Vec<String>,
    },
    SlashCommand {
        command: String,
    },
    Interrupt {},
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(default)]
        message: Option<String>,
    },
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: crate::state::PermissionMode,
    },
    SetAdapter {
        adapter: String,
    },
    QueueMessage {
        content: String,
        #[serde(default)]
        images: Vec<String>,
    },
    UpdateQueuedMessage {
        content: String,
        #[serde(default)]
        images: Vec<String>,
    },
    CancelQueuedMessage {},
}

impl InboundConsumerMessage {
    /// The `WRITE_ACTIONS` key [`crate::gatekeeper::Gatekeeper::authorize`]
    /// checks this inbound message against.
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::SlashCommand { .. } => "slash_command",
            Self::Interrupt {} => "interrupt",
            Self::PermissionResponse { .. } => "permission_response",
            Self::SetModel { .. } => "set_model",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::SetAdapter { .. } => "set_adapter",
            Self::QueueMessage { .. } => "queue_message",
            Self::UpdateQueuedMessage { .. } => "update_queued_message",
            Self::CancelQueuedMessage {} => "cancel_queued_message",
        }
    }
}

/// Presence entry surfaced in `presence_update` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub consumer_id: String,
    pub display_name: Option<String>,
    pub role: Role,
}

/// Outbound frames that are not themselves a [`UnifiedMessage`] (spec.md §6
/// "Outbound ConsumerMessage types" minus the ones that are just a broadcast
/// `UnifiedMessage`, e.g. `session_init`, `assistant`, `result`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    CapabilitiesReady { request_id: String, response: Value },
    CliConnected {},
    CliDisconnected { code: u16, reason: String },
    Identity { consumer_id: String, role: Role, display_name: Option<String> },
    PresenceUpdate { consumers: Vec<PresenceEntry> },
    MessageHistory { messages: Vec<UnifiedMessage> },
    MessageQueued { consumer_id: String, content: String },
    QueuedMessageUpdated { consumer_id: String, content: String },
    QueuedMessageCancelled { consumer_id: String },
    QueuedMessageSent {},
    ResumeFailed { reason: String },
    ProcessOutput { line: String },
    SessionNameUpdate { name: String },
    SlashCommandError { command: String, message: String },
    Error { code: String, message: String, source: Option<String> },
}

/// Anything the bridge can push to a consumer's outbound queue.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(UnifiedMessage),
    Gateway(GatewayEvent),
}

impl OutboundFrame {
    /// Serialize to the frame's wire string, transparently encrypting
    /// through `encryption` when it is attached and active (spec.md §4.5).
    pub fn to_wire(&self, encryption: Option<&EncryptionLayer>) -> Result<String, BridgeError> {
        match (self, encryption) {
            (Self::Message(msg), Some(layer)) => layer.encrypt_outbound(msg),
            (Self::Gateway(evt), Some(layer)) => layer.encrypt_outbound(evt),
            (Self::Message(msg), None) => {
                serde_json::to_string(msg).map_err(|e| error::internal_error(e.to_string()))
            }
            (Self::Gateway(evt), None) => {
                serde_json::to_string(evt).map_err(|e| error::internal_error(e.to_string()))
            }
        }
    }
}

/// Per-consumer bookkeeping owned by the bridge's `consumers` set
/// (spec.md §3 "Ownership rules").
pub struct ConsumerHandle {
    pub id: String,
    pub identity: Identity,
    pub tx: mpsc::Sender<OutboundFrame>,
    pub encryption: Option<Arc<EncryptionLayer>>,
    /// Cancelled by the bridge to force-close a slow consumer
    /// (spec.md §5 "the bridge MUST ... disconnect that consumer").
    pub kick: CancellationToken,
}

impl ConsumerHandle {
    pub fn presence_entry(&self) -> PresenceEntry {
        PresenceEntry {
            consumer_id: self.id.clone(),
            display_name: self.identity.display_name.clone(),
            role: self.identity.role,
        }
    }
}

/// Default bound on a consumer's outbound queue before it is considered
/// slow (spec.md §5).
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default max inbound WebSocket frame size (spec.md §6).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub fn now_epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;
