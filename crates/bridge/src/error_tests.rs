// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn http_status_covers_every_variant() {
    let all = [
        ErrorCode::BackendUnavailable,
        ErrorCode::StartupFailed,
        ErrorCode::AuthRequired,
        ErrorCode::SessionClosed,
        ErrorCode::ParseError,
        ErrorCode::NotSupported,
        ErrorCode::Unauthorized,
        ErrorCode::RateLimited,
        ErrorCode::TooLarge,
        ErrorCode::SlowConsumer,
        ErrorCode::Deactivated,
        ErrorCode::MalformedEnvelope,
        ErrorCode::AuthFailed,
        ErrorCode::InternalError,
    ];
    for code in all {
        assert!(code.http_status() >= 400);
        assert!(!code.as_str().is_empty());
        assert_eq!(code.to_string(), code.as_str());
    }
}

#[test]
fn auth_failures_close_with_4401() {
    assert_eq!(ErrorCode::AuthRequired.ws_close_code(), 4401);
    assert_eq!(ErrorCode::AuthFailed.ws_close_code(), 4401);
    assert_eq!(ErrorCode::Unauthorized.ws_close_code(), 4401);
}

#[test]
fn bridge_error_formats_code_and_message() {
    let err = auth_failed("peer key rotated");
    assert_eq!(err.code, ErrorCode::AuthFailed);
    assert_eq!(err.to_string(), "AUTH_FAILED: peer key rotated");
}
