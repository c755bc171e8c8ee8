//! WebSocket CDP transport — thin client over `tokio-tungstenite`.
//!
//! Commands flow through an mpsc channel into a handler loop that owns
//! the socket; responses come back over per-command oneshots, and
//! protocol events fan out to registered handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use glimpse_core::errors::CdpError;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::session::{CdpSession, EventHandler};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingTx = oneshot::Sender<Result<Value, String>>;
type Handlers = RwLock<HashMap<String, Vec<EventHandler>>>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

struct CdpCommand {
    method: String,
    params: Option<Value>,
    session_id: Option<String>,
    response_tx: PendingTx,
}

/// A live DevTools connection.
pub struct WsTransport {
    cmd_tx: mpsc::Sender<CdpCommand>,
    handlers: Arc<Handlers>,
    _handler: JoinHandle<()>,
}

impl WsTransport {
    /// Connect to a `ws://.../devtools/...` debugger URL.
    pub async fn connect(ws_url: &str) -> Result<Self, CdpError> {
        let (ws, _) = connect_async(ws_url)
            .await
            .map_err(|e| CdpError::Transport(format!("WebSocket connect: {e}")))?;

        let handlers: Arc<Handlers> = Arc::new(RwLock::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<CdpCommand>(64);
        let handler = tokio::spawn(handler_loop(ws, cmd_rx, Arc::clone(&handlers)));

        Ok(Self {
            cmd_tx,
            handlers,
            _handler: handler,
        })
    }

    /// Resolve the browser-level debugger URL from an HTTP endpoint via
    /// `/json/version`.
    pub async fn discover_ws_url(endpoint: &str) -> Result<String, CdpError> {
        let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
        let resp = reqwest::get(&url)
            .await
            .map_err(|e| CdpError::Transport(format!("GET {url}: {e}")))?;
        let version: Value = resp
            .json()
            .await
            .map_err(|e| CdpError::Transport(format!("parse {url}: {e}")))?;
        debugger_url(&version)
            .ok_or_else(|| CdpError::Protocol("no webSocketDebuggerUrl in /json/version".into()))
    }
}

#[async_trait]
impl CdpSession for WsTransport {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, CdpError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CdpCommand {
                method: method.to_string(),
                params,
                session_id: session_id.map(str::to_string),
                response_tx: tx,
            })
            .await
            .map_err(|_| CdpError::Detached("transport closed".into()))?;

        let result = tokio::time::timeout(COMMAND_TIMEOUT, rx)
            .await
            .map_err(|_| CdpError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|_| CdpError::Detached("response dropped".into()))?;

        result.map_err(|msg| classify_protocol_error(&msg))
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }
}

fn debugger_url(version: &Value) -> Option<String> {
    version["webSocketDebuggerUrl"].as_str().map(String::from)
}

/// Browser error strings don't carry a machine-readable class; detach
/// conditions are recognized by message shape.
fn classify_protocol_error(message: &str) -> CdpError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("detach")
        || lowered.contains("target closed")
        || lowered.contains("session with given id not found")
        || lowered.contains("not attached")
    {
        CdpError::Detached(message.to_string())
    } else if lowered.contains("wasn't found") || lowered.contains("not supported") {
        // "'Foo.bar' wasn't found": the target build lacks the domain.
        CdpError::Unsupported(message.to_string())
    } else {
        CdpError::Protocol(message.to_string())
    }
}

async fn handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<CdpCommand>,
    handlers: Arc<Handlers>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let mut msg = json!({
                    "id": id,
                    "method": cmd.method,
                    "params": cmd.params.unwrap_or_else(|| json!({})),
                });
                if let Some(session_id) = cmd.session_id {
                    msg["sessionId"] = Value::String(session_id);
                }
                let _ = pending.insert(id, cmd.response_tx);
                if ws_tx.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(val): Result<Value, _> = serde_json::from_str(&text) else {
                    continue;
                };
                if let Some(id) = val.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = pending.remove(&id) {
                        if let Some(err) = val.get("error") {
                            let msg = err["message"].as_str().unwrap_or("CDP error");
                            let _ = tx.send(Err(msg.to_string()));
                        } else {
                            let _ = tx.send(Ok(val["result"].clone()));
                        }
                    }
                    continue;
                }
                if let Some(method) = val.get("method").and_then(Value::as_str) {
                    let registered: Vec<EventHandler> = handlers
                        .read()
                        .get(method)
                        .map(|v| v.to_vec())
                        .unwrap_or_default();
                    if registered.is_empty() {
                        continue;
                    }
                    let params = val["params"].clone();
                    let session_id = val.get("sessionId").and_then(Value::as_str);
                    for handler in registered {
                        handler(params.clone(), session_id);
                    }
                }
            }
        }
    }

    // Socket gone: fail anything still waiting.
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err("transport closed".to_string()));
    }
    tracing::debug!("cdp transport loop exited");
}
