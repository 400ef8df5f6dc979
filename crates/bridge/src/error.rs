// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error taxonomy shared across the HTTP bootstrap, the WebSocket
/// transport, and the `error` UnifiedMessage kind (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BackendUnavailable,
    StartupFailed,
    AuthRequired,
    SessionClosed,
    ParseError,
    NotSupported,
    Unauthorized,
    RateLimited,
    TooLarge,
    SlowConsumer,
    Deactivated,
    MalformedEnvelope,
    AuthFailed,
    InternalError,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BackendUnavailable => 503,
            Self::StartupFailed => 502,
            Self::AuthRequired => 401,
            Self::SessionClosed => 410,
            Self::ParseError => 400,
            Self::NotSupported => 501,
            Self::Unauthorized => 403,
            Self::RateLimited => 429,
            Self::TooLarge => 413,
            Self::SlowConsumer => 429,
            Self::Deactivated => 409,
            Self::MalformedEnvelope => 400,
            Self::AuthFailed => 401,
            Self::InternalError => 500,
        }
    }

    /// Close code used when the failure must terminate the WebSocket
    /// connection outright rather than just error out one message.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            Self::AuthRequired | Self::Unauthorized | Self::AuthFailed => 4401,
            Self::TooLarge => 1009,
            Self::SlowConsumer => 4408,
            Self::Deactivated | Self::SessionClosed => 4410,
            Self::MalformedEnvelope => 4400,
            _ => 1011,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Self::StartupFailed => "STARTUP_FAILED",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::ParseError => "PARSE_ERROR",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::TooLarge => "TOO_LARGE",
            Self::SlowConsumer => "SLOW_CONSUMER",
            Self::Deactivated => "DEACTIVATED",
            Self::MalformedEnvelope => "MALFORMED_ENVELOPE",
            Self::AuthFailed => "AUTH_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Library-wide error type: an [`ErrorCode`] paired with a human-readable
/// message. Binaries add top-level context with `anyhow`; library code
/// propagates this with `?`.
#[derive(Debug, Clone)]
pub struct BridgeError {
    pub code: ErrorCode,
    pub message: String,
}

impl BridgeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BridgeError {}

macro_rules! bridge_error_ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(message: impl Into<String>) -> BridgeError {
            BridgeError::new(ErrorCode::$code, message)
        }
    };
}

bridge_error_ctor!(backend_unavailable, BackendUnavailable);
bridge_error_ctor!(startup_failed, StartupFailed);
bridge_error_ctor!(auth_required, AuthRequired);
bridge_error_ctor!(session_closed, SessionClosed);
bridge_error_ctor!(parse_error, ParseError);
bridge_error_ctor!(not_supported, NotSupported);
bridge_error_ctor!(unauthorized, Unauthorized);
bridge_error_ctor!(rate_limited, RateLimited);
bridge_error_ctor!(too_large, TooLarge);
bridge_error_ctor!(slow_consumer, SlowConsumer);
bridge_error_ctor!(deactivated, Deactivated);
bridge_error_ctor!(malformed_envelope, MalformedEnvelope);
bridge_error_ctor!(auth_failed, AuthFailed);
bridge_error_ctor!(internal_error, InternalError);

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
