// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `SessionRuntime` — the bookkeeping a single session holds beyond its
//! [`SessionState`] fold, mirroring the teacher's `SessionEntry`
//! (`crates/mux/src/state.rs`): independent `RwLock`/`Mutex` fields rather
//! than one mailbox-serialized actor, so a consumer list lookup never waits
//! behind an in-flight reduce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backoff, BackendSession};
use crate::consumer::ConsumerHandle;
use crate::message::UnifiedMessage;
use crate::state::SessionState;

/// A permission request awaiting a consumer's decision (spec.md §4.4
/// `session/request_permission`).
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub request_id: String,
    pub tool_name: Option<String>,
    pub options: Vec<serde_json::Value>,
    pub requested_at: u64,
}

/// A single-slot queued user message (spec.md §4.3 "queue semantics":
/// at most one pending message per session, owned by whoever queued it).
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub owner_consumer_id: String,
    pub content: String,
    pub images: Vec<String>,
}

/// Everything a live session needs beyond its reducer-owned [`SessionState`].
pub struct SessionRuntime {
    pub id: String,
    pub created_at: u64,
    pub state: RwLock<SessionState>,
    pub history: RwLock<Vec<UnifiedMessage>>,
    pub name: RwLock<Option<String>>,
    pub backend: AsyncMutex<Option<Box<dyn BackendSession>>>,
    pub consumers: RwLock<HashMap<String, Arc<ConsumerHandle>>>,
    pub pending_permissions: RwLock<HashMap<String, PendingPermission>>,
    pub queued_message: Mutex<Option<QueuedMessage>>,
    /// Correlates a bridge-issued `control_request` id to the waiter for its
    /// `control_response` (spec.md §4.4 capabilities protocol).
    pub pending_control_requests:
        Mutex<HashMap<String, tokio::sync::oneshot::Sender<serde_json::Value>>>,
    /// Set while a slash-command turn is in flight, so the adapter's echoed
    /// completion can be converted into `slash_command_result` instead of a
    /// raw `assistant` message (spec.md §9 "Passthrough echoes").
    pub pending_slash_command: Mutex<Option<(String, String)>>,
    /// Guards the one-shot `session:first_turn_completed` event (spec.md §6).
    pub first_turn_completed: AtomicBool,
    /// Per-session reconnect backoff (spec.md §5, §8 property 10).
    pub backoff: Mutex<Backoff>,
    next_request_id: AtomicU64,
    pub cancel: CancellationToken,
}

impl SessionRuntime {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            state: RwLock::new(SessionState::new(id.clone())),
            id,
            created_at: epoch_ms(),
            history: RwLock::new(Vec::new()),
            name: RwLock::new(None),
            backend: AsyncMutex::new(None),
            consumers: RwLock::new(HashMap::new()),
            pending_permissions: RwLock::new(HashMap::new()),
            queued_message: Mutex::new(None),
            pending_control_requests: Mutex::new(HashMap::new()),
            pending_slash_command: Mutex::new(None),
            first_turn_completed: AtomicBool::new(false),
            backoff: Mutex::new(Backoff::default()),
            next_request_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Generate a bridge-local correlation id (distinct from any id the
    /// backend process itself assigns).
    pub fn next_request_id(&self) -> String {
        let n = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.id)
    }

    pub async fn has_backend(&self) -> bool {
        self.backend.lock().await.is_some()
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }
}

/// Snapshot metadata exposed to the transport layer for listing/health
/// endpoints, distinct from the full [`SessionState`] fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: u64,
    pub name: Option<String>,
    pub consumer_count: usize,
    pub has_backend: bool,
}

pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
