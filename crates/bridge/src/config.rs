// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration. Bound to `--flag`/env-var pairs via `clap::Parser`,
//! mirroring the teacher's `MuxConfig` (`crates/mux/src/config.rs`): plain
//! struct, a `validate()` post-parse step, no `Display` impl.

use crate::consumer::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_OUTBOUND_QUEUE_CAPACITY};
use crate::error::BridgeError;

/// Session bridge daemon configuration.
#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// Host to bind the consumer WebSocket listener on.
    #[arg(long, default_value = "127.0.0.1", env = "BRIDGE_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8900, env = "BRIDGE_PORT")]
    pub port: u16,

    /// Static bearer token for consumer authentication. If unset, consumers
    /// are authenticated anonymously with role `participant`.
    #[arg(long, env = "BRIDGE_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Argv for spawning the ACP backend child process, e.g.
    /// `--backend-command=claude-code-acp --backend-command=--stdio`.
    #[arg(long = "backend-command", env = "BRIDGE_BACKEND_COMMAND", value_delimiter = ' ')]
    pub backend_command: Vec<String>,

    /// Maximum number of messages retained per session's in-memory history.
    #[arg(long, default_value_t = 2000, env = "BRIDGE_HISTORY_CAP")]
    pub history_cap: usize,

    /// Maximum inbound consumer WebSocket frame size, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES, env = "BRIDGE_MAX_FRAME_BYTES")]
    pub max_frame_bytes: usize,

    /// Bound on each consumer's outbound queue before it is evicted as slow.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_QUEUE_CAPACITY, env = "BRIDGE_OUTBOUND_QUEUE_CAPACITY")]
    pub outbound_queue_capacity: usize,

    /// Seconds to wait after SIGTERM before escalating to SIGKILL.
    #[arg(long, default_value_t = 5, env = "BRIDGE_CHILD_STOP_GRACE_SECS")]
    pub child_stop_grace_secs: u64,

    /// Log output format.
    #[arg(long, default_value = "text", env = "BRIDGE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Minimum log level, used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info", env = "BRIDGE_LOG_LEVEL")]
    pub log_level: String,

    /// Per-consumer rate limiter: requests allowed per second (token refill rate).
    #[arg(long, default_value_t = 30, env = "BRIDGE_RATE_LIMIT_PER_SEC")]
    pub rate_limit_per_sec: u64,

    /// Per-consumer rate limiter burst capacity.
    #[arg(long, default_value_t = 60, env = "BRIDGE_RATE_LIMIT_BURST")]
    pub rate_limit_burst: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl Config {
    /// Post-parse validation the way the teacher's binaries run it right
    /// after `Parser::parse` and before anything else touches the config.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.backend_command.is_empty() {
            return Err(crate::error::internal_error(
                "--backend-command must name at least a program to spawn",
            ));
        }
        if self.history_cap == 0 {
            return Err(crate::error::internal_error("--history-cap must be at least 1"));
        }
        if self.max_frame_bytes == 0 {
            return Err(crate::error::internal_error("--max-frame-bytes must be at least 1"));
        }
        Ok(())
    }

    pub fn child_stop_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.child_stop_grace_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
