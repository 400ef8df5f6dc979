// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `ConsumerGateway`'s network edge (spec.md §4.5, §6): the axum WebSocket
//! upgrade at `/ws/consumer/{session_id}` and the per-connection read/write
//! loop. Grounded in the teacher's `transport::ws::ws_handler`/`handle_ws`
//! (`crates/mux/src/transport/ws.rs`): a `tokio::select!` over the outbound
//! channel and the socket's inbound stream, with a `CancellationToken` the
//! bridge can fire to force-close a connection.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::bridge::SessionBridge;
use crate::consumer::{ConsumerHandle, GatewayEvent, InboundConsumerMessage, OutboundFrame};
use crate::encryption::EncryptionLayer;
use crate::error::ErrorCode;
use crate::gatekeeper::AuthRequest;

/// Shared handle the HTTP/WS layer needs: the bridge plus the bound frame
/// size, handed to every handler via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<SessionBridge>,
    pub max_frame_bytes: usize,
}

/// `GET /ws/consumer/{session_id}` query parameters (spec.md §6).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerWsQuery {
    pub token: Option<String>,
    pub consumer_id: Option<String>,
    pub display_name: Option<String>,
    /// Base64-encoded X25519 public key; present to request an encrypted
    /// session (spec.md §4.6).
    pub peer_pubkey: Option<String>,
    /// Working directory to launch the backend in, when this consumer is
    /// the one starting the session (spec.md §4.2 `BackendOptions.cwd`).
    pub cwd: Option<String>,
    /// Model override for the backend, if any.
    pub model: Option<String>,
}

/// Build the axum router: health plus the one real endpoint, the consumer
/// WebSocket upgrade.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/ws/consumer/{session_id}", get(ws_consumer_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

async fn ws_consumer_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ConsumerWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let gatekeeper = state.bridge.gatekeeper();
    let auth_request =
        AuthRequest { bearer_token: bearer_from_headers(&headers), query_token: query.token.clone() };

    let mut identity = match gatekeeper.authenticate(&auth_request) {
        Some(identity) => identity,
        None if gatekeeper.has_authenticator() => {
            return (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized.as_str()).into_response();
        }
        None => gatekeeper.create_anonymous_identity(),
    };
    if let Some(consumer_id) = query.consumer_id.clone() {
        identity.id = consumer_id;
    }
    if identity.display_name.is_none() {
        identity.display_name = query.display_name.clone();
    }

    let peer_pubkey = match query.peer_pubkey.as_deref().map(BASE64.decode) {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(_)) => {
            return (StatusCode::BAD_REQUEST, "peer_pubkey is not valid base64").into_response();
        }
        None => None,
    };

    // A generous hard ceiling against unbounded memory growth; the
    // spec-configured `max_frame_bytes` is enforced explicitly in
    // `handle_inbound_text` so an over-limit frame gets a clean
    // `TOO_LARGE` gateway error instead of an abrupt protocol close.
    let backend_options = crate::backend::BackendOptions {
        session_id: session_id.clone(),
        cwd: query.cwd.clone(),
        model: query.model.clone(),
        ..Default::default()
    };

    let hard_ceiling = state.max_frame_bytes.saturating_mul(4).max(1024 * 1024);
    ws.max_message_size(hard_ceiling)
        .on_upgrade(move |socket| {
            handle_consumer_socket(socket, state, session_id, identity, peer_pubkey, backend_options)
        })
        .into_response()
}

async fn handle_consumer_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    identity: crate::gatekeeper::Identity,
    peer_pubkey: Option<Vec<u8>>,
    backend_options: crate::backend::BackendOptions,
) {
    let encryption = match peer_pubkey {
        Some(peer_key) => match EncryptionLayer::generate(session_id.clone()) {
            Ok((layer, _our_pub)) => match layer.pair(&peer_key) {
                Ok(()) => Some(Arc::new(layer)),
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "consumer encryption pairing failed");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "consumer encryption layer init failed");
                None
            }
        },
        None => None,
    };

    let capacity = state.bridge.outbound_queue_capacity();
    let (tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(capacity);
    let handle =
        state.bridge.register_consumer(&session_id, identity, tx, encryption.clone(), backend_options).await;
    let limiter = state.bridge.gatekeeper().create_rate_limiter(&handle.id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut close_code = 1000u16;
    let mut close_reason = "normal".to_owned();

    loop {
        tokio::select! {
            _ = handle.kick.cancelled() => {
                close_code = 1008;
                close_reason = "slow consumer".to_owned();
                break;
            }

            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        match frame.to_wire(encryption.as_deref()) {
                            Ok(text) => {
                                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(session_id = %session_id, error = %err, "failed to encode outbound frame");
                            }
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(&state, &session_id, &handle, &limiter, encryption.as_deref(), text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: close_code,
            reason: close_reason.clone().into(),
        })))
        .await;
    if let Some(layer) = &encryption {
        layer.deactivate();
    }
    state.bridge.unregister_consumer(&session_id, &handle.id, close_code, &close_reason).await;
}

async fn handle_inbound_text(
    state: &AppState,
    session_id: &str,
    handle: &Arc<ConsumerHandle>,
    limiter: &crate::gatekeeper::RateLimiter,
    encryption: Option<&EncryptionLayer>,
    text: &str,
) {
    if text.len() > state.max_frame_bytes {
        send_gateway_error(handle, ErrorCode::TooLarge, "frame exceeds max size");
        return;
    }
    if !limiter.check() {
        send_gateway_error(handle, ErrorCode::RateLimited, "rate limit exceeded");
        return;
    }

    let parsed: Result<InboundConsumerMessage, _> = match encryption {
        Some(layer) => layer.decrypt_inbound(text),
        None => serde_json::from_str(text).map_err(|e| crate::error::parse_error(e.to_string())),
    };
    let msg = match parsed {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!(session_id, error = %err, "dropping unparsable consumer frame");
            return;
        }
    };

    if let Err(err) = state.bridge.route_consumer_message(session_id, handle, msg).await {
        send_gateway_error(handle, err.code, &err.message);
    }
}

fn send_gateway_error(handle: &Arc<ConsumerHandle>, code: ErrorCode, message: &str) {
    let _ = handle.tx.try_send(OutboundFrame::Gateway(GatewayEvent::Error {
        code: code.as_str().to_owned(),
        message: message.to_owned(),
        source: None,
    }));
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
