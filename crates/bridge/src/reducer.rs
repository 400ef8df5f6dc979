// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The pure reducer: `reduce(state, msg) -> state'`.
//!
//! `reduce` never mutates its input and performs no I/O. Replaying a
//! recorded message stream through `reduce` must reconstruct identical
//! state every time (spec.md §8 property 1).

use serde::Deserialize;
use serde_json::Value;

use crate::message::{MessageType, UnifiedMessage};
use crate::state::{GitInfo, ModelUsage, PermissionMode, SessionState, SessionStatus};

/// A single entry of the `model_usage` metadata array on a `result` message.
#[derive(Debug, Deserialize)]
struct ModelUsageEntry {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_tokens: u64,
    #[serde(default)]
    context_window: u64,
}

/// Fold one [`UnifiedMessage`] into a [`SessionState`], returning the new
/// state. `state` is taken by value and consumed; callers that need the
/// prior value should clone before calling.
pub fn reduce(state: SessionState, msg: &UnifiedMessage) -> SessionState {
    match msg.kind {
        MessageType::SessionInit => reduce_session_init(state, msg),
        MessageType::SessionUpdate => reduce_session_update(state, msg),
        MessageType::Result => reduce_result(state, msg),
        MessageType::StatusChange => reduce_status_change(state, msg),
        _ => state,
    }
}

fn reduce_session_init(mut state: SessionState, msg: &UnifiedMessage) -> SessionState {
    if let Some(id) = msg.meta_str("backend_session_id") {
        state.backend_session_id = Some(id.to_owned());
    }
    if let Some(model) = msg.meta_str("model") {
        state.model = Some(model.to_owned());
    }
    if let Some(cwd) = msg.meta_str("cwd") {
        state.cwd = Some(cwd.to_owned());
    }
    if let Some(mode) = msg.meta_str("permission_mode") {
        state.permission_mode = parse_permission_mode(mode).unwrap_or(state.permission_mode);
    }
    let git = GitInfo {
        branch: msg.meta_str("git_branch").map(str::to_owned),
        commit: msg.meta_str("git_commit").map(str::to_owned),
        worktree: msg.meta_str("git_worktree").map(str::to_owned),
    };
    if git.branch.is_some() || git.commit.is_some() || git.worktree.is_some() {
        state.git = Some(git);
    }
    if let Some(team) = read_team(msg) {
        state.team = Some(team);
    }
    state
}

fn reduce_session_update(mut state: SessionState, msg: &UnifiedMessage) -> SessionState {
    if let Some(model) = msg.meta_str("model") {
        state.model = Some(model.to_owned());
    }
    if let Some(cwd) = msg.meta_str("cwd") {
        state.cwd = Some(cwd.to_owned());
    }
    // Team roster present-vs-absent is meaningful: only overwrite when the
    // message actually carries a `team` key. Absence keeps the prior value.
    if let Some(team) = read_team(msg) {
        state.team = Some(team);
    }
    state
}

fn reduce_result(mut state: SessionState, msg: &UnifiedMessage) -> SessionState {
    if let Some(cost) = msg.meta_f64("cost_usd") {
        state.total_cost_usd += cost;
    }
    state.num_turns += msg.meta_u64("num_turns").unwrap_or(1);
    state.total_lines_added += msg.meta_u64("lines_added").unwrap_or(0);
    state.total_lines_removed += msg.meta_u64("lines_removed").unwrap_or(0);

    if let Some(percent) = compute_context_used_percent(msg) {
        state.context_used_percent = percent.clamp(0.0, 100.0);
    }
    state
}

fn reduce_status_change(mut state: SessionState, msg: &UnifiedMessage) -> SessionState {
    let Some(status) = msg.meta_str("status") else {
        return state;
    };
    state.is_compacting = status == "compacting";
    state.status = match status {
        "running" => SessionStatus::Running,
        "compacting" => SessionStatus::Compacting,
        _ => SessionStatus::Idle,
    };
    state
}

fn read_team(msg: &UnifiedMessage) -> Option<Vec<String>> {
    let value = msg.metadata.get("team")?;
    match value {
        Value::Array(items) => {
            Some(items.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        }
        _ => None,
    }
}

fn parse_permission_mode(s: &str) -> Option<PermissionMode> {
    match s {
        "default" => Some(PermissionMode::Default),
        "plan" => Some(PermissionMode::Plan),
        "bypass" => Some(PermissionMode::Bypass),
        _ => None,
    }
}

/// Implements the §9 open-question resolution: sum usage entries that share
/// a `context_window`; when entries disagree on window, prefer whichever
/// entry's model matches `active_model` metadata (falling back to the last
/// entry in the array, which adapters are expected to emit in activity
/// order).
fn compute_context_used_percent(msg: &UnifiedMessage) -> Option<f64> {
    let raw = msg.metadata.get("model_usage")?;
    let entries: Vec<ModelUsageEntry> = serde_json::from_value(raw.clone()).ok()?;
    if entries.is_empty() {
        return None;
    }

    let active_model = msg.meta_str("active_model");
    let windows: std::collections::HashSet<u64> =
        entries.iter().map(|e| e.context_window).collect();

    if windows.len() <= 1 {
        let usage = sum_usage(&entries);
        return Some(percent_of(&usage));
    }

    let chosen = active_model
        .and_then(|active| entries.iter().find(|e| e.model.as_deref() == Some(active)))
        .or_else(|| entries.last())?;
    let usage = ModelUsage {
        input_tokens: chosen.input_tokens,
        output_tokens: chosen.output_tokens,
        cache_tokens: chosen.cache_tokens,
        context_window: chosen.context_window,
    };
    Some(percent_of(&usage))
}

fn sum_usage(entries: &[ModelUsageEntry]) -> ModelUsage {
    let mut usage = ModelUsage { context_window: entries[0].context_window, ..Default::default() };
    for e in entries {
        usage.input_tokens += e.input_tokens;
        usage.output_tokens += e.output_tokens;
        usage.cache_tokens += e.cache_tokens;
    }
    usage
}

fn percent_of(usage: &ModelUsage) -> f64 {
    if usage.context_window == 0 {
        return 0.0;
    }
    let used = (usage.input_tokens + usage.output_tokens + usage.cache_tokens) as f64;
    used / usage.context_window as f64 * 100.0
}

#[cfg(test)]
#[path = "reducer_tests.rs"]
mod tests;
