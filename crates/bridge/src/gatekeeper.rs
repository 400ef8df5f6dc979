// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authentication and authorization for consumer connections (spec.md §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

/// A consumer's role, used for deny-by-default action checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Observer,
}

/// Write actions a consumer might attempt; all are denied for non-participants.
pub const WRITE_ACTIONS: &[&str] = &[
    "user_message",
    "slash_command",
    "queue_message",
    "update_queued_message",
    "cancel_queued_message",
    "permission_response",
    "set_model",
    "set_permission_mode",
    "interrupt",
];

/// A consumer's authenticated (or anonymous) identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self { id: Uuid::new_v4().to_string(), role: Role::Participant, display_name: None }
    }
}

/// Request context an authenticator inspects to produce an [`Identity`].
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub bearer_token: Option<String>,
    pub query_token: Option<String>,
}

/// Pluggable authentication policy. The default `Gatekeeper` treats a
/// configured static token the same way the teacher's `validate_bearer`
/// does — constant-time comparison, `None` meaning auth is disabled.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &AuthRequest) -> Option<Identity>;
}

/// Bearer/query-token authenticator backed by a single shared secret.
pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, request: &AuthRequest) -> Option<Identity> {
        let candidate = request.bearer_token.as_deref().or(request.query_token.as_deref())?;
        if constant_time_eq(candidate, &self.token) {
            Some(Identity { id: Uuid::new_v4().to_string(), role: Role::Participant, display_name: None })
        } else {
            None
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Per-consumer token-bucket rate limiter.
pub struct RateLimiter {
    capacity: u64,
    refill_per_sec: u64,
    tokens: Mutex<(u64, Instant)>,
}

impl RateLimiter {
    pub fn new(capacity: u64, refill_per_sec: u64) -> Self {
        Self { capacity, refill_per_sec, tokens: Mutex::new((capacity, Instant::now())) }
    }

    /// Returns `true` if the caller may proceed, consuming one token.
    pub fn check(&self) -> bool {
        let mut guard = self.tokens.lock().expect("rate limiter mutex poisoned");
        let (tokens, last) = &mut *guard;
        let elapsed = last.elapsed();
        let refill = (elapsed.as_secs_f64() * self.refill_per_sec as f64) as u64;
        if refill > 0 {
            *tokens = (*tokens + refill).min(self.capacity);
            *last = Instant::now();
        }
        if *tokens == 0 {
            false
        } else {
            *tokens -= 1;
            true
        }
    }
}

/// Authenticates connections and authorizes actions by role.
pub struct Gatekeeper {
    authenticator: Option<Box<dyn Authenticator>>,
    next_anon: AtomicU64,
    limiters: Mutex<HashMap<String, std::sync::Arc<RateLimiter>>>,
    limiter_capacity: u64,
    limiter_refill_per_sec: u64,
}

impl Gatekeeper {
    pub fn new(authenticator: Option<Box<dyn Authenticator>>) -> Self {
        Self {
            authenticator,
            next_anon: AtomicU64::new(0),
            limiters: Mutex::new(HashMap::new()),
            limiter_capacity: 60,
            limiter_refill_per_sec: 30,
        }
    }

    pub fn with_rate_limit(mut self, capacity: u64, refill_per_sec: u64) -> Self {
        self.limiter_capacity = capacity;
        self.limiter_refill_per_sec = refill_per_sec;
        self
    }

    pub fn has_authenticator(&self) -> bool {
        self.authenticator.is_some()
    }

    /// Authenticate a consumer, or return `None` (auth failed) when an
    /// authenticator is configured and rejects the request.
    pub fn authenticate(&self, request: &AuthRequest) -> Option<Identity> {
        match &self.authenticator {
            Some(auth) => auth.authenticate(request),
            None => None,
        }
    }

    pub fn create_anonymous_identity(&self) -> Identity {
        let n = self.next_anon.fetch_add(1, Ordering::Relaxed);
        Identity {
            id: format!("anon-{n}-{}", Uuid::new_v4()),
            role: Role::Participant,
            display_name: None,
        }
    }

    /// Deny-by-default authorization: only `Role::Participant` may perform
    /// any action in [`WRITE_ACTIONS`]; everything else (read-only actions)
    /// is always allowed.
    pub fn authorize(&self, identity: &Identity, action: &str) -> bool {
        if WRITE_ACTIONS.contains(&action) {
            identity.role == Role::Participant
        } else {
            true
        }
    }

    pub fn create_rate_limiter(&self, consumer_id: &str) -> std::sync::Arc<RateLimiter> {
        let mut guard = self.limiters.lock().expect("gatekeeper mutex poisoned");
        std::sync::Arc::clone(guard.entry(consumer_id.to_owned()).or_insert_with(|| {
            std::sync::Arc::new(RateLimiter::new(self.limiter_capacity, self.limiter_refill_per_sec))
        }))
    }

    pub fn drop_rate_limiter(&self, consumer_id: &str) {
        self.limiters.lock().expect("gatekeeper mutex poisoned").remove(consumer_id);
    }
}

/// Convert an authorization failure into the transport's error code.
pub fn unauthorized_code() -> ErrorCode {
    ErrorCode::Unauthorized
}

#[cfg(test)]
#[path = "gatekeeper_tests.rs"]
mod tests;
