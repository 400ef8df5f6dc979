// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The reduced view of a session: [`SessionState`] and the small enums it
//! carries.

use serde::{Deserialize, Serialize};

/// Permission mode a backend is operating under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Default,
    Plan,
    Bypass,
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Default
    }
}

/// Coarse lifecycle status of a session's current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Compacting,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// Optional git/worktree context surfaced by a backend's `session_init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitInfo {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub worktree: Option<String>,
}

/// Per-model token usage used to compute `context_used_percent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub context_window: u64,
}

/// The reduced view of a session, maintained solely by [`crate::reducer::reduce`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Bridge-assigned session id (stable across backend reconnects).
    pub session_id: String,
    /// Session id assigned by the backend/agent; may differ from `session_id`.
    #[serde(default)]
    pub backend_session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub git: Option<GitInfo>,
    /// Team roster; presence vs. absence is meaningful — `None` means "no
    /// update asserted", not "no team".
    #[serde(default)]
    pub team: Option<Vec<String>>,

    pub total_cost_usd: f64,
    pub num_turns: u64,
    pub context_used_percent: f64,
    pub total_lines_added: u64,
    pub total_lines_removed: u64,

    pub is_compacting: bool,
    pub permission_mode: PermissionMode,
    pub status: SessionStatus,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), ..Default::default() }
    }
}
