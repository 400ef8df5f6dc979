// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use session_bridge::config::{Config, LogFormat};

#[derive(Parser)]
#[command(name = "session-bridge", version, about = "Bridges AI agent backends to consumer WebSocket clients.")]
struct Cli {
    #[command(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = cli.config;

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    if let Err(e) = session_bridge::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
