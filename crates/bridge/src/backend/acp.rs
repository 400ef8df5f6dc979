// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `AcpSession` — the reference hard adapter (spec.md §4.3). Wraps a child
//! process whose stdio carries newline-delimited JSON-RPC 2.0, translating
//! between the wire protocol and [`UnifiedMessage`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use super::{AdapterCapabilities, Availability, BackendAdapter, BackendOptions, BackendSession};
use crate::error::{self, BridgeError};
use crate::message::{ContentBlock, MessageType, Role, UnifiedMessage};

/// Spawns the configured child command and wraps it as an [`AcpSession`].
pub struct AcpAdapter {
    command: Vec<String>,
    stop_grace: Duration,
}

impl AcpAdapter {
    pub fn new(command: Vec<String>, stop_grace: Duration) -> Self {
        Self { command, stop_grace }
    }
}

impl BackendAdapter for AcpAdapter {
    fn connect(
        &self,
        options: BackendOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BackendSession>, BridgeError>> + Send>> {
        let command = self.command.clone();
        let stop_grace = self.stop_grace;
        Box::pin(async move { AcpSession::spawn(&command, options, stop_grace).await })
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Local,
            teams: false,
        }
    }
}

/// A frame queued for the I/O task to write to the child's stdin.
enum OutboundFrame {
    /// A fully pre-framed line (e.g. the bridge's `control_request`).
    Raw(Vec<u8>),
    /// A request this adapter issued; tracked so the matching response can
    /// be translated back into UnifiedMessages.
    Tracked { id: u64, kind: PendingKind, bytes: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
enum PendingKind {
    Prompt,
}

pub struct AcpSession {
    session_id: String,
    pid: i32,
    cancel: CancellationToken,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    stop_grace: Duration,
    child: Arc<AsyncMutex<Child>>,
    messages_rx: AsyncMutex<Option<mpsc::Receiver<UnifiedMessage>>>,
}

impl AcpSession {
    async fn spawn(
        command: &[String],
        options: BackendOptions,
        stop_grace: Duration,
    ) -> Result<Box<dyn BackendSession>, BridgeError> {
        let Some((program, args)) = command.split_first() else {
            return Err(error::startup_failed("backend command is empty"));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| error::backend_unavailable(format!("spawn failed: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| error::startup_failed("child exited before handshake"))? as i32;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();

        tokio::spawn(io_loop(
            options.session_id.clone(),
            stdin,
            stdout,
            outbound_rx,
            messages_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(stderr_loop(stderr, messages_tx, cancel.clone()));

        Ok(Box::new(Self {
            session_id: options.session_id,
            pid,
            cancel,
            outbound_tx,
            next_id: AtomicU64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
            stop_grace,
            child: Arc::new(AsyncMutex::new(child)),
            messages_rx: AsyncMutex::new(Some(messages_rx)),
        }))
    }
}

impl BackendSession for AcpSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(
        &self,
        msg: UnifiedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>> {
        if self.closed.load(Ordering::SeqCst) {
            return Box::pin(async { Err(error::session_closed("session is closed")) });
        }
        let frame = match build_outbound_frame(&self.session_id, &self.next_id, msg) {
            Ok(f) => f,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let tx = self.outbound_tx.clone();
        Box::pin(async move {
            tx.send(frame).map_err(|_| error::session_closed("backend stdin is gone"))
        })
    }

    fn send_raw(
        &self,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>> {
        if self.closed.load(Ordering::SeqCst) {
            return Box::pin(async { Err(error::session_closed("session is closed")) });
        }
        let tx = self.outbound_tx.clone();
        Box::pin(async move {
            tx.send(OutboundFrame::Raw(bytes))
                .map_err(|_| error::session_closed("backend stdin is gone"))
        })
    }

    fn messages(&mut self) -> mpsc::Receiver<UnifiedMessage> {
        self.messages_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .expect("messages() called more than once on an AcpSession")
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let pid = self.pid;
        let cancel = self.cancel.clone();
        let closed = Arc::clone(&self.closed);
        let child = Arc::clone(&self.child);
        let stop_grace = self.stop_grace;
        Box::pin(async move {
            if closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
            cancel.cancel();

            let mut child = child.lock().await;
            let graceful = tokio::time::timeout(stop_grace, child.wait()).await;
            if graceful.is_err() {
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
                let _ = child.wait().await;
            }
        })
    }
}

/// Translate an outgoing [`UnifiedMessage`] into a JSON-RPC frame
/// (spec.md §4.3 point 1). The adapter-assigned `session_id` always
/// overrides any `session_id` the bridge may have stamped into metadata.
fn build_outbound_frame(
    session_id: &str,
    next_id: &AtomicU64,
    msg: UnifiedMessage,
) -> Result<OutboundFrame, BridgeError> {
    match msg.kind {
        MessageType::UserMessage | MessageType::SlashCommand => {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            let text = msg.plain_text();
            let request = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "session/prompt",
                "params": {
                    "sessionId": session_id,
                    "prompt": [{"type": "text", "text": text}],
                },
            });
            Ok(OutboundFrame::Tracked {
                id,
                kind: PendingKind::Prompt,
                bytes: frame_line(&request)?,
            })
        }
        MessageType::Interrupt => {
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "session/cancel",
                "params": {"sessionId": session_id},
            });
            Ok(OutboundFrame::Raw(frame_line(&notification)?))
        }
        MessageType::PermissionResponse => {
            let request_id = msg
                .meta_str("request_id")
                .ok_or_else(|| error::parse_error("permission_response missing request_id"))?;
            let behavior = msg.meta_str("behavior").unwrap_or("deny");
            let outcome = if behavior == "allow" {
                json!({"outcome": "selected", "optionId": msg.meta_str("option_id")})
            } else {
                json!({"outcome": "cancelled"})
            };
            let response = json!({
                "jsonrpc": "2.0",
                "id": parse_id(request_id),
                "result": {"outcome": outcome},
            });
            Ok(OutboundFrame::Raw(frame_line(&response)?))
        }
        MessageType::ConfigurationChange => {
            let field = msg.meta_str("field").unwrap_or_default();
            let method = match field {
                "model" => "session/set_model",
                "permission_mode" => "session/set_mode",
                _ => return Err(error::not_supported("unknown configuration_change field")),
            };
            let notification = json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": {"sessionId": session_id, "value": msg.metadata.get("value")},
            });
            Ok(OutboundFrame::Raw(frame_line(&notification)?))
        }
        _ => Err(error::not_supported("message kind is not sendable to the backend")),
    }
}

fn parse_id(raw: &str) -> Value {
    raw.parse::<u64>().map(Value::from).unwrap_or_else(|_| Value::from(raw))
}

fn frame_line(value: &Value) -> Result<Vec<u8>, BridgeError> {
    let mut bytes =
        serde_json::to_vec(value).map_err(|e| error::internal_error(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Per-turn accumulation state, owned exclusively by the I/O task.
#[derive(Default)]
struct TurnState {
    text_buf: String,
    thinking_buf: String,
    running_emitted: bool,
}

async fn io_loop(
    bridge_session_id: String,
    mut stdin: tokio::process::ChildStdin,
    stdout: tokio::process::ChildStdout,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    messages_tx: mpsc::Sender<UnifiedMessage>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut pending: HashMap<u64, PendingKind> = HashMap::new();
    let mut turn = TurnState::default();
    let mut pending_permission_id: Option<Value> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let bytes = match frame {
                    OutboundFrame::Raw(bytes) => bytes,
                    OutboundFrame::Tracked { id, kind, bytes } => {
                        pending.insert(id, kind);
                        bytes
                    }
                };
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        handle_inbound_line(
                            &bridge_session_id,
                            &line,
                            &mut pending,
                            &mut turn,
                            &mut pending_permission_id,
                            &mut stdin,
                            &messages_tx,
                        )
                        .await;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }

    // Stream end: reject every in-flight prompt request and signal the
    // bridge that the backend has ended (spec.md §4.3 state machine,
    // "* | stream end | Terminal").
    for (id, _) in pending.drain() {
        let err = UnifiedMessage::new(MessageType::Error, Role::System)
            .with_meta("request_id", id.to_string())
            .with_meta("reason", "stream_ended");
        let _ = messages_tx.send(err).await;
    }
}

async fn stderr_loop(
    stderr: tokio::process::ChildStderr,
    messages_tx: mpsc::Sender<UnifiedMessage>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let msg = UnifiedMessage::new(MessageType::Error, Role::System)
                            .with_meta("source", "stderr")
                            .with_meta("line", line);
                        if messages_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}

async fn handle_inbound_line(
    bridge_session_id: &str,
    line: &str,
    pending: &mut HashMap<u64, PendingKind>,
    turn: &mut TurnState,
    pending_permission_id: &mut Option<Value>,
    stdin: &mut tokio::process::ChildStdin,
    messages_tx: &mpsc::Sender<UnifiedMessage>,
) {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        tracing::warn!(session_id = %bridge_session_id, outcome = "parse_error", "unparsable ACP line");
        return;
    };

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        match value.get("id") {
            None => handle_notification(bridge_session_id, method, &value, turn, messages_tx).await,
            Some(id) => {
                handle_agent_request(method, id, &value, pending_permission_id, stdin, messages_tx)
                    .await
            }
        }
        return;
    }

    if let Some(id) = value.get("id") {
        handle_response(id, &value, pending, turn, messages_tx).await;
    }
}

async fn handle_notification(
    bridge_session_id: &str,
    method: &str,
    value: &Value,
    turn: &mut TurnState,
    messages_tx: &mpsc::Sender<UnifiedMessage>,
) {
    if method != "session/update" {
        return;
    }
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    // Support both the nested `{sessionId, update: {...}}` shape and the
    // flat `{sessionId, sessionUpdate, ...}` shape.
    let (update, kind) = match params.get("update") {
        Some(update) => (
            update.clone(),
            update.get("sessionUpdate").and_then(Value::as_str).unwrap_or_default().to_owned(),
        ),
        None => (
            params.clone(),
            params.get("sessionUpdate").and_then(Value::as_str).unwrap_or_default().to_owned(),
        ),
    };

    match kind.as_str() {
        "agent_message_chunk" => {
            turn.text_buf.push_str(&chunk_text(&update));
            if !turn.running_emitted {
                turn.running_emitted = true;
                let status = UnifiedMessage::new(MessageType::StatusChange, Role::System)
                    .with_meta("status", "running");
                let _ = messages_tx.send(status).await;
            }
        }
        "agent_thought_chunk" => {
            turn.thinking_buf.push_str(&chunk_text(&update));
        }
        _ => {
            let passthrough = UnifiedMessage::new(MessageType::StreamEvent, Role::System)
                .with_meta("session_id", bridge_session_id.to_owned())
                .with_meta("subtype", kind)
                .with_meta("raw", update);
            let _ = messages_tx.send(passthrough).await;
        }
    }
}

fn chunk_text(update: &Value) -> String {
    let content = update.get("content").unwrap_or(&Value::Null);
    content.get("text").and_then(Value::as_str).unwrap_or_default().to_owned()
}

async fn handle_agent_request(
    method: &str,
    id: &Value,
    value: &Value,
    pending_permission_id: &mut Option<Value>,
    stdin: &mut tokio::process::ChildStdin,
    messages_tx: &mpsc::Sender<UnifiedMessage>,
) {
    if method.starts_with("fs/") || method.starts_with("terminal/") {
        let response = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "method not supported"},
        });
        if let Ok(bytes) = frame_line(&response) {
            let _ = stdin.write_all(&bytes).await;
        }
        return;
    }

    if method == "session/request_permission" {
        *pending_permission_id = Some(id.clone());
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let request_id = id.as_str().map(str::to_owned).unwrap_or_else(|| id.to_string());
        let msg = UnifiedMessage::new(MessageType::PermissionRequest, Role::System)
            .with_meta("request_id", request_id)
            .with_meta("tool_name", params.get("toolCall").and_then(|t| t.get("title")).cloned().unwrap_or(Value::Null))
            .with_meta("input", params.get("toolCall").cloned().unwrap_or(Value::Null))
            .with_meta("options", params.get("options").cloned().unwrap_or(Value::Null));
        let _ = messages_tx.send(msg).await;
    }
}

async fn handle_response(
    id: &Value,
    value: &Value,
    pending: &mut HashMap<u64, PendingKind>,
    turn: &mut TurnState,
    messages_tx: &mpsc::Sender<UnifiedMessage>,
) {
    let Some(numeric_id) = id.as_u64() else {
        // A response to a sendRaw-issued frame (e.g. the bridge's
        // `initialize` control request). Pass it through untouched and let
        // the bridge correlate it against its own pendingInitialize id.
        let msg = build_control_response(id, value);
        let _ = messages_tx.send(msg).await;
        return;
    };

    let Some(PendingKind::Prompt) = pending.remove(&numeric_id) else {
        let msg = build_control_response(id, value);
        let _ = messages_tx.send(msg).await;
        return;
    };

    if let Some(err) = value.get("error") {
        let is_provider_auth = err.get("data").and_then(|d| d.get("code")).and_then(Value::as_str)
            == Some("provider_auth");
        if is_provider_auth {
            let auth = UnifiedMessage::new(MessageType::AuthStatus, Role::System)
                .with_meta("link", err.get("data").and_then(|d| d.get("link")).cloned().unwrap_or(Value::Null))
                .with_meta("description", err.get("message").cloned().unwrap_or(Value::Null));
            let _ = messages_tx.send(auth).await;
        }
        let result = UnifiedMessage::new(MessageType::Result, Role::System)
            .with_meta("is_error", true)
            .with_meta("code", if is_provider_auth { "provider_auth" } else { "error" })
            .with_meta("error", err.clone());
        let _ = messages_tx.send(result).await;
        turn.running_emitted = false;
        turn.text_buf.clear();
        turn.thinking_buf.clear();
        return;
    }

    let result = value.get("result").cloned().unwrap_or(Value::Null);
    if result.get("stopReason").is_some() {
        let mut content = Vec::new();
        if !turn.thinking_buf.is_empty() {
            content.push(ContentBlock::Thinking { text: std::mem::take(&mut turn.thinking_buf) });
        }
        if !turn.text_buf.is_empty() {
            content.push(ContentBlock::Text { text: std::mem::take(&mut turn.text_buf) });
        }
        let assistant =
            UnifiedMessage::new(MessageType::Assistant, Role::Assistant).with_content(content);
        let _ = messages_tx.send(assistant).await;
    }
    turn.running_emitted = false;

    let result_msg = UnifiedMessage::new(MessageType::Result, Role::System)
        .with_meta("is_error", false)
        .with_meta("num_turns", 1)
        .with_meta("cost_usd", result.get("costUsd").and_then(Value::as_f64).unwrap_or(0.0))
        .with_meta("model_usage", result.get("modelUsage").cloned().unwrap_or(Value::Null));
    let _ = messages_tx.send(result_msg).await;
}

fn build_control_response(id: &Value, value: &Value) -> UnifiedMessage {
    let request_id = id.as_str().map(str::to_owned).unwrap_or_else(|| id.to_string());
    UnifiedMessage::new(MessageType::ControlResponse, Role::System)
        .with_meta("request_id", request_id)
        .with_meta("response", value.get("result").cloned().unwrap_or(Value::Null))
        .with_meta("error", value.get("error").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
#[path = "acp_tests.rs"]
mod tests;
