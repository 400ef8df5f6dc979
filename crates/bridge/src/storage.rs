// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Storage` — the persistence collaborator from spec.md §2/§6. Specified
//! only at the interface level: load/save a size-capped session snapshot.
//! Object-safe, matching [`crate::backend::BackendAdapter`]'s boxed-future
//! convention so the bridge can hold it as `Box<dyn Storage>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::message::UnifiedMessage;
use crate::state::SessionState;

/// Minimum persisted fields for a session snapshot (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    #[serde(default)]
    pub backend_session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    pub created_at: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub state: SessionState,
    /// Size-capped inline copy of the message history.
    pub history: Vec<UnifiedMessage>,
}

/// Pluggable persistence backend. Storage errors are logged but never
/// interrupt a session (spec.md §7).
pub trait Storage: Send + Sync {
    fn save(
        &self,
        snapshot: SessionSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>>;

    fn load(
        &self,
        session_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SessionSnapshot>, BridgeError>> + Send>>;
}

/// In-process default: an in-memory map, useful for tests and for running
/// the bridge without a configured durable backend.
#[derive(Default)]
pub struct InMemoryStorage {
    snapshots: Mutex<HashMap<String, SessionSnapshot>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save(
        &self,
        snapshot: SessionSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>> {
        self.snapshots.lock().expect("storage mutex poisoned").insert(snapshot.id.clone(), snapshot);
        Box::pin(async { Ok(()) })
    }

    fn load(
        &self,
        session_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SessionSnapshot>, BridgeError>> + Send>> {
        let found = self.snapshots.lock().expect("storage mutex poisoned").get(&session_id).cloned();
        Box::pin(async { Ok(found) })
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
