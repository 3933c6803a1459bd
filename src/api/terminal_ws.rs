// 终端 WebSocket 桥：多连接扇出、断线宽限、命令边界检测与文件变更提示。
use crate::api::errors::error_response_with_detail;
use crate::auth::{extract_bearer_token, extract_query_token};
use crate::commands::InstallCommand;
use crate::container::ContainerError;
use crate::state::SharedState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SOCKET_CHANNEL_SIZE: usize = 64;

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Per-session fan-out state. The entry outlives individual sockets so a
/// reconnect within the grace window resumes the same PTY and buffer.
struct BridgeEntry {
    session_id: String,
    sockets: DashMap<String, mpsc::Sender<Message>>,
    /// Raw-input accumulator for command-boundary detection.
    buffer: Mutex<String>,
    /// Pending disconnect-grace timer; cancelled when a socket attaches.
    grace: Mutex<Option<CancellationToken>>,
    /// Set once the entry is torn down; a socket holding a stale Arc must
    /// re-fetch from the registry instead of attaching here.
    closed: AtomicBool,
    /// Serializes PTY attach and grace-expiry teardown for this session.
    open_lock: Arc<tokio::sync::Mutex<()>>,
}

pub struct TerminalBridge {
    sessions: DashMap<String, Arc<BridgeEntry>>,
}

impl TerminalBridge {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    fn entry(&self, session_id: &str) -> Arc<BridgeEntry> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(BridgeEntry {
                    session_id: session_id.to_string(),
                    sockets: DashMap::new(),
                    buffer: Mutex::new(String::new()),
                    grace: Mutex::new(None),
                    closed: AtomicBool::new(false),
                    open_lock: Arc::new(tokio::sync::Mutex::new(())),
                })
            })
            .clone()
    }

    fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Used by the explicit-termination path to drop fan-out state
    /// without waiting for the grace timer.
    pub fn drop_session(&self, session_id: &str) {
        if let Some((_, entry)) = self.sessions.remove(session_id) {
            entry.closed.store(true, Ordering::SeqCst);
            if let Some(token) = entry.grace.lock().take() {
                token.cancel();
            }
        }
    }
}

impl Default for TerminalBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

fn frame(kind: &str, data: Value) -> Message {
    let text = json!({ "type": kind, "data": data }).to_string();
    Message::Text(text.into())
}

/// The ping reply carries no payload at all, just the bare type.
fn pong_frame() -> Message {
    Message::Text(json!({ "type": "pong" }).to_string().into())
}

async fn broadcast(entry: &BridgeEntry, message: Message) {
    let senders: Vec<(String, mpsc::Sender<Message>)> = entry
        .sockets
        .iter()
        .map(|socket| (socket.key().clone(), socket.value().clone()))
        .collect();
    for (socket_id, sender) in senders {
        if sender.send(message.clone()).await.is_err() {
            entry.sockets.remove(&socket_id);
        }
    }
}

pub(crate) async fn ws_terminal(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = extract_bearer_token(&headers).or_else(|| extract_query_token(query.as_deref()));
    let Some(token) = token else {
        return error_response_with_detail(
            StatusCode::UNAUTHORIZED,
            Some("AUTH_REQUIRED"),
            "missing token",
            None,
            None,
        );
    };
    let user = match state.users.authenticate_token(&token) {
        Ok(Some(user)) => user,
        Ok(None) => {
            return error_response_with_detail(
                StatusCode::UNAUTHORIZED,
                Some("UNAUTHORIZED"),
                "invalid or expired token",
                None,
                None,
            )
        }
        Err(err) => {
            return error_response_with_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                err.to_string(),
                None,
                None,
            )
        }
    };

    // Ownership resolves before the upgrade; the verdict is delivered as
    // a websocket close code so browser clients can read it.
    let deny = match state.manager.get_owned(&session_id, &user.user_id) {
        Ok(_) => None,
        Err(ContainerError::SessionNotFound) | Err(ContainerError::AccessDenied) => {
            Some(CLOSE_POLICY_VIOLATION)
        }
        Err(_) => Some(CLOSE_INTERNAL_ERROR),
    };

    ws.on_upgrade(move |socket| handle_socket(state, session_id, deny, socket))
}

async fn handle_socket(
    state: SharedState,
    session_id: String,
    deny: Option<u16>,
    socket: WebSocket,
) {
    let (mut sink, mut stream) = socket.split();

    if let Some(code) = deny {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "session unavailable".into(),
            })))
            .await;
        return;
    }

    // Dedicated writer task per socket; handlers only touch the channel.
    let (tx, mut rx) = mpsc::channel::<Message>(SOCKET_CHANNEL_SIZE);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let socket_id = Uuid::new_v4().simple().to_string();

    // Fetch-and-attach loop: a grace timer can tear the entry down while
    // this socket waits for its lock. A closed entry is discarded and a
    // fresh one taken from the registry. Grace cancel, PTY attach, and
    // socket registration all happen under the same lock the timer holds
    // during teardown, so the timer either sees this socket or runs
    // strictly before it.
    let entry = loop {
        let candidate = state.bridge.entry(&session_id);
        let guard = candidate.open_lock.clone().lock_owned().await;
        if candidate.closed.load(Ordering::SeqCst) {
            drop(guard);
            continue;
        }
        if let Some(token) = candidate.grace.lock().take() {
            token.cancel();
            debug!(session = %session_id, "重连命中宽限期，取消清理");
        }
        match state.terminal.open(&session_id) {
            Ok(Some(output_rx)) => {
                tokio::spawn(pump_output(candidate.clone(), output_rx));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(session = %session_id, "终端挂载失败: {err}");
                let code = match err {
                    ContainerError::SessionNotFound | ContainerError::AccessDenied => {
                        CLOSE_POLICY_VIOLATION
                    }
                    _ => CLOSE_INTERNAL_ERROR,
                };
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: "terminal attach failed".into(),
                    })))
                    .await;
                drop(tx);
                let _ = writer.await;
                if candidate.sockets.is_empty() {
                    candidate.closed.store(true, Ordering::SeqCst);
                    state.bridge.remove(&session_id);
                }
                return;
            }
        }
        candidate.sockets.insert(socket_id.clone(), tx.clone());
        break candidate;
    };
    info!(session = %session_id, socket = %socket_id, "终端连接建立");

    let _ = tx
        .send(frame("connected", json!({ "session_id": session_id })))
        .await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_text(&state, &entry, &tx, text.as_str()).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    entry.sockets.remove(&socket_id);
    info!(session = %session_id, socket = %socket_id, "终端连接断开");
    drop(tx);
    let _ = writer.await;

    if entry.sockets.is_empty() {
        schedule_grace(state, entry);
    }
}

/// Last socket gone: keep the PTY alive for the grace window, then tear
/// it down and forget the buffered input.
fn schedule_grace(state: SharedState, entry: Arc<BridgeEntry>) {
    let token = CancellationToken::new();
    *entry.grace.lock() = Some(token.clone());
    let grace = Duration::from_secs(state.config.terminal.reconnect_grace_s);
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }
        // The sleep firing is not the verdict: a reconnect may already be
        // past its own cancel. Whoever claims the registered token under
        // the attach lock wins.
        let _guard = entry.open_lock.clone().lock_owned().await;
        if !claim_grace(&entry, &token) {
            return;
        }
        if !entry.sockets.is_empty() {
            return;
        }
        info!(session = %entry.session_id, "宽限期结束，卸载终端");
        entry.closed.store(true, Ordering::SeqCst);
        entry.buffer.lock().clear();
        state.terminal.close_pty(&entry.session_id);
        state.bridge.remove(&entry.session_id);
    });
}

/// True only when `token` is still the registered grace timer. A socket
/// that reconnected meanwhile has already taken and cancelled it, and the
/// timer must stand down.
fn claim_grace(entry: &BridgeEntry, token: &CancellationToken) -> bool {
    let taken = entry.grace.lock().take();
    taken.is_some() && !token.is_cancelled()
}

async fn pump_output(entry: Arc<BridgeEntry>, mut output_rx: mpsc::Receiver<String>) {
    while let Some(chunk) = output_rx.recv().await {
        broadcast(&entry, frame("terminal_output", json!({ "output": chunk }))).await;
    }
    debug!(session = %entry.session_id, "终端输出泵结束");
}

async fn handle_text(state: &SharedState, entry: &Arc<BridgeEntry>, tx: &mpsc::Sender<Message>, text: &str) {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            let _ = tx
                .send(frame(
                    "error",
                    json!({ "code": "INVALID_JSON", "message": err.to_string() }),
                ))
                .await;
            return;
        }
    };
    match envelope.kind.as_str() {
        "ping" => {
            let _ = tx.send(pong_frame()).await;
        }
        "input" => {
            let Some(command) = extract_text(envelope.data.as_ref(), "command") else {
                let _ = tx
                    .send(frame(
                        "error",
                        json!({ "code": "INVALID_PAYLOAD", "message": "missing command" }),
                    ))
                    .await;
                return;
            };
            process_command_line(state, entry, &command, true).await;
        }
        "terminal_input" => {
            let Some(data) = extract_text(envelope.data.as_ref(), "data") else {
                return;
            };
            match state.terminal.send_raw_input(&entry.session_id, data.as_bytes()) {
                Ok(true) => {}
                Ok(false) => {
                    let _ = tx
                        .send(frame(
                            "error",
                            json!({ "code": "PTY_DEAD", "message": "terminal is not available" }),
                        ))
                        .await;
                    return;
                }
                Err(err) => {
                    warn!(session = %entry.session_id, "终端输入转发失败: {err}");
                    return;
                }
            }
            for line in accumulate_lines(entry, &data) {
                process_command_line(state, entry, &line, false).await;
            }
        }
        other => {
            debug!(session = %entry.session_id, kind = %other, "忽略未知消息类型");
        }
    }
}

/// Accepts either a bare string or an object carrying the named field.
fn extract_text(data: Option<&Value>, field: &str) -> Option<String> {
    match data {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Object(map)) => map
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Appends a raw chunk to the session buffer and drains completed lines.
fn accumulate_lines(entry: &BridgeEntry, chunk: &str) -> Vec<String> {
    let mut buffer = entry.buffer.lock();
    buffer.push_str(chunk);
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find(['\n', '\r']) {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Shared completed-line handling for both input paths. `forward` is true
/// for whole-command messages that still need to reach the PTY; raw
/// keystrokes have already been echoed through it.
async fn process_command_line(
    state: &SharedState,
    entry: &Arc<BridgeEntry>,
    line: &str,
    forward: bool,
) {
    let session_id = entry.session_id.clone();
    let install = state.classifier.detect_install(line);

    if let Some(install) = &install {
        // Network goes up before the command runs so the first resolver
        // lookup succeeds; a failed toggle is reported but not fatal.
        let enabled = state.terminal.enable_network(&session_id).await;
        broadcast(
            entry,
            frame(
                "status",
                json!({
                    "message": format!("network enabled for {} install", install.base),
                    "network": enabled,
                }),
            ),
        )
        .await;
    }

    if forward {
        match state.terminal.send_command(&session_id, line) {
            Ok(true) => {}
            Ok(false) => {
                // PTY 已死：报错帧但不断开，连接保持可用。
                broadcast(
                    entry,
                    frame(
                        "error",
                        json!({ "code": "PTY_DEAD", "message": "terminal is not available" }),
                    ),
                )
                .await;
                return;
            }
            Err(err) => {
                warn!(session = %session_id, "命令下发失败: {err}");
                return;
            }
        }
    } else {
        state
            .terminal
            .record_command(&session_id, line, None, None, None);
        state.manager.touch(&session_id);
    }

    if let Some(InstallCommand { base }) = install {
        let monitor_state = state.clone();
        let monitor_entry = entry.clone();
        tokio::spawn(async move {
            let session_id = monitor_entry.session_id.clone();
            let observed = monitor_state
                .terminal
                .wait_install_complete(&session_id, &base)
                .await;
            // Disable runs on every exit path of the monitor.
            monitor_state.terminal.disable_network(&session_id).await;
            broadcast(
                &monitor_entry,
                frame(
                    "status",
                    json!({
                        "message": format!("{base} install finished, network disabled"),
                        "observed": observed,
                    }),
                ),
            )
            .await;
        });
    }

    if let Some(cwd) = state.terminal.track_cwd(&session_id, line) {
        broadcast(entry, frame("directory_change", json!({ "cwd": cwd }))).await;
    }

    if let Some(kind) = state.classifier.classify_fs_change(line) {
        let delay = Duration::from_millis(state.config.terminal.fs_notify_delay_ms);
        let notify_entry = entry.clone();
        let command = line.to_string();
        // Delay gives the command time to land on disk before the client
        // refreshes its file tree.
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broadcast(
                &notify_entry,
                frame(
                    "filesystem_change",
                    json!({ "command_type": kind.as_str(), "command": command }),
                ),
            )
            .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry() -> Arc<BridgeEntry> {
        Arc::new(BridgeEntry {
            session_id: "cbx_test".to_string(),
            sockets: DashMap::new(),
            buffer: Mutex::new(String::new()),
            grace: Mutex::new(None),
            closed: AtomicBool::new(false),
            open_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    #[test]
    fn pong_reply_is_bare_type_only() {
        match pong_frame() {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"type":"pong"}"#),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn grace_claim_wins_while_token_is_registered() {
        let entry = test_entry();
        let token = CancellationToken::new();
        *entry.grace.lock() = Some(token.clone());
        assert!(claim_grace(&entry, &token));
        // Claiming consumes the registration.
        assert!(entry.grace.lock().is_none());
    }

    #[test]
    fn grace_claim_loses_to_a_reconnect() {
        let entry = test_entry();
        let token = CancellationToken::new();
        *entry.grace.lock() = Some(token.clone());
        // A reconnecting socket takes and cancels the timer first.
        let taken = entry.grace.lock().take().unwrap();
        taken.cancel();
        assert!(!claim_grace(&entry, &token));
    }

    #[test]
    fn accumulate_lines_detects_boundaries() {
        let entry = test_entry();
        assert!(accumulate_lines(&entry, "ls -l").is_empty());
        assert_eq!(accumulate_lines(&entry, "a\n"), vec!["ls -la".to_string()]);
    }

    #[test]
    fn accumulate_lines_handles_crlf_and_blank_lines() {
        let entry = test_entry();
        let lines = accumulate_lines(&entry, "pwd\r\n\r\necho hi\n");
        assert_eq!(lines, vec!["pwd".to_string(), "echo hi".to_string()]);
        assert!(entry.buffer.lock().is_empty());
    }

    #[test]
    fn extract_text_accepts_string_and_object() {
        assert_eq!(
            extract_text(Some(&json!("ls")), "command"),
            Some("ls".to_string())
        );
        assert_eq!(
            extract_text(Some(&json!({ "command": "ls" })), "command"),
            Some("ls".to_string())
        );
        assert_eq!(extract_text(Some(&json!(42)), "command"), None);
        assert_eq!(extract_text(None, "command"), None);
    }
}
