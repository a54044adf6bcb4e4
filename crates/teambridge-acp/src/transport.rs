//! Line-delimited JSON-RPC over the agent's stdio
//!
//! Outgoing requests are correlated to responses by numeric id. Everything
//! the agent initiates — `session/update` notifications and
//! `session/request_permission` requests — is forwarded onto a channel the
//! session supervisor drains.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Agent-initiated traffic.
#[derive(Debug)]
pub enum Incoming {
    /// A request expecting a response (permission prompts).
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// A fire-and-forget notification (session updates).
    Notification { method: String, params: Value },
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>;

pub struct AgentConnection {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
}

impl AgentConnection {
    /// Wrap the child's stdio. Returns the connection, the channel of
    /// agent-initiated traffic, and the reader task handle.
    pub fn new(
        stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> (Arc<Self>, mpsc::Receiver<Incoming>, JoinHandle<()>) {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let message: Value = match serde_json::from_str(trimmed) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("unparseable line from agent: {}", e);
                                continue;
                            }
                        };
                        dispatch(message, &reader_pending, &incoming_tx).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("error reading agent stdout: {}", e);
                        break;
                    }
                }
            }
            // EOF: fail every caller still waiting on a response
            let mut pending = reader_pending.lock().unwrap_or_else(|e| e.into_inner());
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err("agent closed its output stream".to_string()));
            }
            debug!("agent reader finished");
        });

        let conn = Arc::new(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
        });
        (conn, incoming_rx, reader)
    }

    /// Send a request and await its response, bounded by `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, String> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(id, tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.send(&payload).await {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&id);
            return Err(format!("cannot write to agent: {}", e));
        }
        trace!(method = method, id = id, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("agent connection dropped".to_string()),
            Err(_) => {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(&id);
                Err(format!("{} timed out after {:?}", method, timeout))
            }
        }
    }

    /// Reply to an agent-initiated request.
    pub async fn respond(&self, id: Value, result: Value) {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        });
        if let Err(e) = self.send(&payload).await {
            warn!("cannot send response to agent: {}", e);
        }
    }

    /// Reply to an agent-initiated request with an error.
    pub async fn respond_error(&self, id: Value, code: i32, message: &str) {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        });
        if let Err(e) = self.send(&payload).await {
            warn!("cannot send error response to agent: {}", e);
        }
    }

    async fn send(&self, payload: &Value) -> std::io::Result<()> {
        let mut line = serde_json::to_string(payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }
}

async fn dispatch(message: Value, pending: &PendingMap, incoming_tx: &mpsc::Sender<Incoming>) {
    let has_id = message.get("id").is_some();
    let has_method = message.get("method").is_some();

    if has_id && !has_method {
        // Response to one of our requests
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            warn!("response with non-numeric id: {}", message);
            return;
        };
        let sender = {
            let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&id)
        };
        let Some(sender) = sender else {
            warn!(id = id, "response for unknown request id");
            return;
        };
        let outcome = if let Some(error) = message.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown agent error");
            Err(format!("agent error {}: {}", code, text))
        } else {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = sender.send(outcome);
        return;
    }

    if has_method {
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let incoming = if has_id {
            Incoming::Request {
                id: message["id"].clone(),
                method,
                params,
            }
        } else {
            Incoming::Notification { method, params }
        };
        if incoming_tx.send(incoming).await.is_err() {
            debug!("incoming channel closed, dropping agent message");
        }
        return;
    }

    warn!("unrecognized message from agent: {}", message);
}
