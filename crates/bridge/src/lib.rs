// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod backend;
pub mod bridge;
pub mod config;
pub mod consumer;
pub mod encryption;
pub mod error;
pub mod event;
pub mod gatekeeper;
pub mod message;
pub mod reducer;
pub mod session;
pub mod state;
pub mod storage;
pub mod tracer;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::backend::acp::AcpAdapter;
use crate::bridge::SessionBridge;
use crate::config::Config;
use crate::gatekeeper::{Gatekeeper, StaticTokenAuthenticator};
use crate::storage::InMemoryStorage;
use crate::tracer::{NoopMetrics, TracingTracer};
use crate::transport::{build_router, AppState};

/// Assemble the bridge's collaborators from `config` and serve the consumer
/// WebSocket gateway until shutdown. Mirrors the teacher's `coop_mux::run`
/// (`crates/mux/src/lib.rs`): build state, bind, `axum::serve` with graceful
/// shutdown on Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let addr = config.bind_addr();
    let shutdown = CancellationToken::new();

    let adapter = Box::new(AcpAdapter::new(config.backend_command.clone(), config.child_stop_grace()));
    let authenticator = config
        .auth_token
        .clone()
        .map(|token| Box::new(StaticTokenAuthenticator::new(token)) as Box<dyn crate::gatekeeper::Authenticator>);
    let gatekeeper = Arc::new(
        Gatekeeper::new(authenticator)
            .with_rate_limit(config.rate_limit_burst, config.rate_limit_per_sec),
    );
    let storage = Box::new(InMemoryStorage::new());
    let tracer = Box::new(TracingTracer);
    let metrics = Box::new(NoopMetrics);

    let bridge = SessionBridge::new(adapter, gatekeeper, storage, tracer, metrics)
        .with_limits(config.history_cap, config.outbound_queue_capacity);

    let state = AppState { bridge, max_frame_bytes: config.max_frame_bytes };
    let router = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "session-bridge listening");

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_signal.cancel();
        }
    });

    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;
    Ok(())
}
