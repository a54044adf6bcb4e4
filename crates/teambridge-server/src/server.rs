//! Stdio JSON-RPC loop and graceful shutdown
//!
//! Stdout is reserved for protocol traffic; every log line goes to stderr.
//! Requests are handled concurrently — a synchronous `assign_task` must not
//! block other tool calls — with a single writer guarding stdout.

use crate::handlers::dispatch;
use crate::state::SharedState;
use crate::tools::{tool_catalogue, ToolCall};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use teambridge_acp::process;
use teambridge_core::redact::redact;
use teambridge_core::{MessageKind, Result, RpcRequest, RpcResponse, ToolCallResult, BROADCAST_TO, ORCHESTRATOR_SENDER};
use teambridge_bus::MessageOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

type SharedStdout = Arc<tokio::sync::Mutex<tokio::io::Stdout>>;

/// Serve the Orchestrator Protocol until stdin closes.
pub async fn run_stdio_server(state: SharedState) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let stdout: SharedStdout = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));

    info!("orchestrator protocol server listening on stdio");
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: RpcRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                warn!("unparseable request line: {}", e);
                continue;
            }
        };
        let Some(id) = request.id.clone() else {
            debug!(method = %request.method, "notification ignored");
            continue;
        };

        let state = state.clone();
        let stdout = stdout.clone();
        tokio::spawn(async move {
            let response = handle_request(&state, &request.method, request.params, id).await;
            write_response(&stdout, &response).await;
        });
    }
    info!("stdin closed, server loop ending");
    Ok(())
}

async fn handle_request(
    state: &SharedState,
    method: &str,
    params: Value,
    id: Value,
) -> RpcResponse {
    match method {
        "initialize" => RpcResponse::ok(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "teambridge",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => RpcResponse::ok(id, json!({ "tools": tool_catalogue() })),
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return RpcResponse::invalid_params(id, "tools/call requires a tool name");
            };
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            let result = call_tool(state, name, &arguments).await;
            match serde_json::to_value(&result) {
                Ok(value) => RpcResponse::ok(id, value),
                Err(e) => RpcResponse::internal_error(id, e.to_string()),
            }
        }
        "ping" => RpcResponse::ok(id, json!({})),
        other => RpcResponse::method_not_found(id, other),
    }
}

/// Run one tool call; every failure becomes an `isError:true` result rather
/// than a transport-level error.
async fn call_tool(state: &SharedState, name: &str, arguments: &Value) -> ToolCallResult {
    let call = match ToolCall::parse(name, arguments) {
        Ok(call) => call,
        Err(e) => return ToolCallResult::error(redact(&e.to_string())),
    };
    match dispatch(state, call).await {
        Ok(value) => ToolCallResult::json(&value),
        Err(e) => {
            if !e.is_caller_error() {
                error!(tool = name, "tool call failed: {}", e);
            }
            ToolCallResult::error(redact(&e.to_string()))
        }
    }
}

async fn write_response(stdout: &SharedStdout, response: &RpcResponse) {
    let mut line = match serde_json::to_string(response) {
        Ok(line) => line,
        Err(e) => {
            error!("cannot serialize response: {}", e);
            return;
        }
    };
    line.push('\n');
    let mut stdout = stdout.lock().await;
    if let Err(e) = stdout.write_all(line.as_bytes()).await {
        error!("cannot write response: {}", e);
        return;
    }
    let _ = stdout.flush().await;
}

/// Orchestrator shutdown: broadcast a `shutdown` bus message, SIGTERM every
/// known agent process, give them the grace period, SIGKILL the survivors,
/// then clear bus and registry state.
pub async fn graceful_shutdown(state: &SharedState) {
    info!("shutting down: notifying agents");
    let broadcast = teambridge_core::retry::retry_with_backoff(
        "shutdown broadcast",
        3,
        Duration::from_millis(100),
        || async {
            state.bus.write_message(
                ORCHESTRATOR_SENDER,
                BROADCAST_TO,
                "bridge shutting down",
                MessageOptions::kind(MessageKind::Shutdown),
            )
        },
    )
    .await;
    if let Err(e) = broadcast {
        warn!("shutdown broadcast incomplete: {}", e);
    }

    let mut pids: Vec<u32> = state
        .registry
        .get_all()
        .into_iter()
        .filter_map(|entry| entry.pid)
        .collect();
    pids.extend(state.tasks.iter().filter_map(|entry| entry.pid));
    pids.sort_unstable();
    pids.dedup();

    for pid in &pids {
        process::sigterm(*pid);
    }
    if !pids.is_empty() {
        info!(count = pids.len(), "sent SIGTERM to agent processes");
        tokio::time::sleep(Duration::from_secs(5)).await;
        for pid in &pids {
            if process::pid_alive(*pid) {
                warn!(pid = pid, "agent survived SIGTERM, killing");
                process::sigkill(*pid);
            }
        }
    }

    if let Err(e) = state.bus.cleanup_all() {
        warn!("bus cleanup failed: {}", e);
    }
    state.registry.clear();
    info!("shutdown complete");
}
