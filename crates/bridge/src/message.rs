// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The unified, adapter-agnostic message type flowing between backends,
//! the reducer, and consumers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of message kinds a [`UnifiedMessage`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SessionInit,
    SessionUpdate,
    StatusChange,
    UserMessage,
    Assistant,
    StreamEvent,
    Result,
    PermissionRequest,
    PermissionResponse,
    PermissionCancelled,
    ToolProgress,
    ToolUseSummary,
    AuthStatus,
    ControlRequest,
    ControlResponse,
    ConfigurationChange,
    Interrupt,
    SlashCommand,
    SlashCommandResult,
    QueueMessage,
    UpdateQueuedMessage,
    CancelQueuedMessage,
    Error,
}

impl MessageType {
    /// Stable tag used in logs and the `message:outbound` event bus entry
    /// (spec.md §6); identical to the `#[serde(rename_all = "snake_case")]`
    /// wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionInit => "session_init",
            Self::SessionUpdate => "session_update",
            Self::StatusChange => "status_change",
            Self::UserMessage => "user_message",
            Self::Assistant => "assistant",
            Self::StreamEvent => "stream_event",
            Self::Result => "result",
            Self::PermissionRequest => "permission_request",
            Self::PermissionResponse => "permission_response",
            Self::PermissionCancelled => "permission_cancelled",
            Self::ToolProgress => "tool_progress",
            Self::ToolUseSummary => "tool_use_summary",
            Self::AuthStatus => "auth_status",
            Self::ControlRequest => "control_request",
            Self::ControlResponse => "control_response",
            Self::ConfigurationChange => "configuration_change",
            Self::Interrupt => "interrupt",
            Self::SlashCommand => "slash_command",
            Self::SlashCommandResult => "slash_command_result",
            Self::QueueMessage => "queue_message",
            Self::UpdateQueuedMessage => "update_queued_message",
            Self::CancelQueuedMessage => "cancel_queued_message",
            Self::Error => "error",
        }
    }
}

/// Who originated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single block within a message's ordered content sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        text: String,
    },
    Image {
        data: String,
        mime_type: String,
    },
    Code {
        language: String,
        text: String,
    },
    Refusal {
        text: String,
    },
}

/// The single message type shared across every adapter and every consumer.
///
/// Invariant: every message carries enough metadata for [`crate::reducer::reduce`]
/// to fold it into [`crate::state::SessionState`] without consulting any
/// message other than the current one and the prior state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl UnifiedMessage {
    pub fn new(kind: MessageType, role: Role) -> Self {
        Self { kind, role, content: Vec::new(), metadata: HashMap::new() }
    }

    pub fn with_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.push(ContentBlock::Text { text: text.into() });
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Shorthand accessor for a string metadata field.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    /// Concatenate all `text`-bearing content blocks, used to synthesize a
    /// final assistant message from streamed chunks.
    pub fn plain_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } | ContentBlock::Thinking { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
