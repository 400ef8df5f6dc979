// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::{HeaderMap, HeaderValue};

use super::*;

#[test]
fn bearer_from_headers_extracts_token() {
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
    assert_eq!(bearer_from_headers(&headers), Some("abc123".to_owned()));
}

#[test]
fn bearer_from_headers_ignores_non_bearer_schemes() {
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
    assert_eq!(bearer_from_headers(&headers), None);
}

#[test]
fn bearer_from_headers_missing_header() {
    assert_eq!(bearer_from_headers(&HeaderMap::new()), None);
}

#[test]
fn consumer_ws_query_default_is_all_none() {
    let query = ConsumerWsQuery::default();
    assert!(query.token.is_none());
    assert!(query.consumer_id.is_none());
    assert!(query.display_name.is_none());
    assert!(query.peer_pubkey.is_none());
}
