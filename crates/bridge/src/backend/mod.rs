// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `BackendAdapter` / `BackendSession` contract (spec.md §4.2) and the
//! pieces shared by every adapter: connection options, static capabilities,
//! and the reconnect backoff helper.

pub mod acp;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::message::UnifiedMessage;
use crate::state::PermissionMode;

/// Inputs to `BackendAdapter::connect`.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub session_id: String,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub resume_backend_session_id: Option<String>,
    pub permission_mode_hint: Option<PermissionMode>,
}

/// Where an adapter's backend process can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Local,
    Remote,
    Hybrid,
}

/// Static, per-adapter capability declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub permissions: bool,
    pub slash_commands: bool,
    pub availability: Availability,
    pub teams: bool,
}

/// A factory that produces [`BackendSession`]s for one backend kind.
///
/// Object-safe: methods return boxed futures rather than using `async fn`,
/// matching the rest of this crate's trait-object conventions.
pub trait BackendAdapter: Send + Sync {
    fn connect(
        &self,
        options: BackendOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BackendSession>, BridgeError>> + Send>>;

    fn capabilities(&self) -> AdapterCapabilities;
}

/// A live handle to one running agent backend.
///
/// `messages()` is a lazy, single-consumer stream: the first call creates
/// the channel's receiver half and hands ownership to the caller (the
/// bridge's consumption task). Calling it twice is a logic error in any
/// adapter implementation and panics, matching spec.md §9's single-consumer
/// design note.
pub trait BackendSession: Send {
    fn session_id(&self) -> &str;

    fn send(
        &self,
        msg: UnifiedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>>;

    /// Admit a prebuilt raw frame (e.g. a JSON-RPC `control_request`).
    /// Adapters without raw-frame support reject with `NotSupported`.
    fn send_raw(
        &self,
        _bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>> {
        Box::pin(async { Err(crate::error::not_supported("sendRaw is not supported")) })
    }

    /// Take ownership of the message stream. Must be called at most once.
    fn messages(&mut self) -> mpsc::Receiver<UnifiedMessage>;

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Geometric reconnect backoff capped at 30s, resetting to the initial
/// delay on a successful open (spec.md §5 timeouts, §8 property 10).
///
/// Grounded in the teacher's `backoff_ms`/`max_backoff_ms` doubling in
/// `crates/mux/src/upstream/bridge.rs`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    current_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self { initial_ms, max_ms, current_ms: initial_ms, attempt: 0 }
    }

    /// Current attempt count (resets to 0 after `reset`).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next reconnect attempt, then doubles for
    /// next time (capped at `max_ms`).
    pub fn next_delay_ms(&mut self) -> u64 {
        let delay = self.current_ms;
        self.current_ms = (self.current_ms.saturating_mul(2)).min(self.max_ms);
        self.attempt += 1;
        delay
    }

    /// Reset to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(1000, 30_000)
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
