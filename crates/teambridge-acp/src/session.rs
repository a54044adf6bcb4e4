//! Session supervisor — one end-to-end agent run
//!
//! Lifecycle: spawn → initialize → newSession → setSessionModel (best
//! effort) → context injection → prompt → stream updates → teardown. Every
//! protocol step races the child-exit watcher; an unexpected exit aborts the
//! session with the exit status and the stderr tail. Nothing raises out of
//! here — every path returns an `AcpResult`.

use crate::process;
use crate::spawn::spawn_agent;
use crate::transport::{AgentConnection, Incoming};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use teambridge_core::{
    truncate_to, AcpResult, SpawnConfig, ToolCallRecord, MAX_AGENT_OUTPUT, MAX_STDERR,
    MAX_TOOL_OUTPUT,
};
use teambridge_policy::{PermissionAction, PermissionContext, PolicyEngine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Handshake step timeout (initialize, newSession).
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-session hard limit.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// SIGTERM → SIGKILL grace.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Stderr bytes included in protocol error messages.
const STDERR_TAIL_IN_ERRORS: usize = 2 * 1024;
/// `rawOutput` is only forwarded when its serialized form is below this.
const RAW_OUTPUT_LIMIT: usize = 10_000;

/// Caller-provided integration points. The server wires these to the bus and
/// registry; the supervisor itself stays messaging-agnostic.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// The agent process started; `pid` can be signalled for cancellation.
    fn on_spawned(&self, _pid: u32) {}

    /// Called once before the prompt is sent. Returning `Some` prepends the
    /// block (unread teammate messages) to the prompt.
    async fn inject_context(&self, _agent: &str) -> Option<String> {
        None
    }

    /// The session ended in error.
    async fn on_error(&self, _agent: &str) {}

    /// One tool call was observed.
    fn on_tool_call(&self, _agent: &str) {}
}

/// Everything `run_session` needs besides the spawn config.
pub struct SessionOptions {
    pub agent_name: String,
    /// Requested model id; matched against the agent's advertised models.
    pub model: Option<String>,
    pub prompt: String,
    pub project_root: PathBuf,
    pub policy: Arc<PolicyEngine>,
    /// Whether `ask` verdicts auto-approve (config `permissions.autoApprove`).
    pub auto_approve: bool,
    pub hooks: Option<Arc<dyn SessionHooks>>,
    pub session_timeout: Duration,
}

/// Instruction block prepended to every prompt.
pub fn frame_prompt(prompt: &str) -> String {
    format!(
        "Reply with your result as plain text directly in the conversation; \
         do not write it to a file unless asked. If a tool permission is \
         denied, do not give up: retry the task with an alternative allowed \
         tool.\n\n{}",
        prompt
    )
}

/// Run one agent session to completion.
pub async fn run_session(spawn_config: SpawnConfig, opts: SessionOptions) -> AcpResult {
    let mut child = match spawn_agent(&spawn_config) {
        Ok(child) => child,
        Err(e) => {
            warn!(agent = %opts.agent_name, "agent spawn failed: {}", e);
            return AcpResult::failure(format!("spawn failed: {}", e));
        }
    };
    let pid = child.id();
    if let (Some(pid), Some(hooks)) = (pid, opts.hooks.as_ref()) {
        hooks.on_spawned(pid);
    }

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
        teardown(&mut child, pid).await;
        return AcpResult::failure("agent process has no stdio pipes");
    };

    // Stderr collector — survives every cancellation below.
    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let mut stderr_task = None;
    if let Some(stderr) = stderr {
        let buf = stderr_buf.clone();
        stderr_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut guard = buf.lock().unwrap_or_else(|e| e.into_inner());
                guard.push_str(&line);
                guard.push('\n');
                // keep the head once over cap; later lines fall off
                truncate_to(&mut guard, MAX_STDERR);
            }
        }));
    }

    let (conn, mut incoming, reader_task) = AgentConnection::new(stdin, stdout);
    let mut state = StreamState::default();

    let deadline = tokio::time::Instant::now() + opts.session_timeout;
    let driven = tokio::time::timeout_at(
        deadline,
        drive_session(&mut child, &conn, &mut incoming, &mut state, &opts),
    )
    .await;

    teardown(&mut child, pid).await;
    reader_task.abort();
    // The pipe is closed once the child is reaped; give the collector a
    // moment to drain what was written before the exit.
    if let Some(task) = stderr_task {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    let mut result = AcpResult {
        output: state.merged_output(),
        error: None,
        timed_out: false,
        stop_reason: None,
        tool_calls: state.tool_calls,
    };

    match driven {
        Ok(Ok(stop_reason)) => {
            result.stop_reason = stop_reason;
            info!(
                agent = %opts.agent_name,
                tool_calls = result.tool_calls.len(),
                output_bytes = result.output.len(),
                "session completed"
            );
        }
        Ok(Err(message)) => {
            let stderr_tail = tail_of(&stderr_buf, STDERR_TAIL_IN_ERRORS);
            let full = if stderr_tail.is_empty() {
                message
            } else {
                format!("{} (stderr: {})", message, stderr_tail)
            };
            warn!(agent = %opts.agent_name, "session failed: {}", full);
            result.error = Some(full);
            if let Some(hooks) = opts.hooks.as_ref() {
                hooks.on_error(&opts.agent_name).await;
            }
        }
        Err(_) => {
            warn!(
                agent = %opts.agent_name,
                "session exceeded {:?}, terminating",
                opts.session_timeout
            );
            result.timed_out = true;
            result.error = Some(format!(
                "session timed out after {} seconds",
                opts.session_timeout.as_secs()
            ));
            if let Some(hooks) = opts.hooks.as_ref() {
                hooks.on_error(&opts.agent_name).await;
            }
        }
    }

    result
}

/// The protocol steps, racing the exit watcher throughout.
/// Returns the stop reason on success.
async fn drive_session(
    child: &mut Child,
    conn: &Arc<AgentConnection>,
    incoming: &mut tokio::sync::mpsc::Receiver<Incoming>,
    state: &mut StreamState,
    opts: &SessionOptions,
) -> Result<Option<String>, String> {
    // 1. Initialize
    let init = race_exit(
        child,
        conn.request(
            "initialize",
            json!({
                "protocolVersion": 1,
                "clientCapabilities": { "fs": { "readTextFile": false, "writeTextFile": false } },
                "clientInfo": { "name": "teambridge", "version": env!("CARGO_PKG_VERSION") },
            }),
            INIT_TIMEOUT,
        ),
    )
    .await?
    .map_err(|e| format!("initialize failed: {}", e))?;
    if let Some(agent_info) = init.get("agentInfo") {
        debug!(agent = %opts.agent_name, info = %agent_info, "agent initialized");
    }

    // 2. New session
    let session = race_exit(
        child,
        conn.request(
            "newSession",
            json!({
                "cwd": opts.project_root.to_string_lossy(),
                "mcpServers": [],
            }),
            INIT_TIMEOUT,
        ),
    )
    .await?
    .map_err(|e| format!("newSession failed: {}", e))?;
    let session_id = session
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| "newSession returned no sessionId".to_string())?
        .to_string();

    // 3. Set model (best effort)
    if let Some(requested) = opts.model.as_deref() {
        if let Some(model_id) = find_model(&session, requested) {
            let set = race_exit(
                child,
                conn.request(
                    "setSessionModel",
                    json!({ "sessionId": session_id, "modelId": model_id }),
                    INIT_TIMEOUT,
                ),
            )
            .await?;
            if let Err(e) = set {
                warn!(agent = %opts.agent_name, model = requested, "setSessionModel failed: {}", e);
            }
        } else {
            debug!(
                agent = %opts.agent_name,
                model = requested,
                "requested model not advertised by agent"
            );
        }
    }

    // 4. Context injection
    let mut final_prompt = frame_prompt(&opts.prompt);
    if let Some(hooks) = opts.hooks.as_ref() {
        if let Some(context) = hooks.inject_context(&opts.agent_name).await {
            final_prompt = format!("{}\n\n{}", context, final_prompt);
        }
    }

    // 5 + 6. Prompt, then stream updates until the response lands
    let prompt_fut = conn.request(
        "prompt",
        json!({
            "sessionId": session_id,
            "prompt": [{ "type": "text", "text": final_prompt }],
        }),
        opts.session_timeout,
    );
    tokio::pin!(prompt_fut);

    loop {
        tokio::select! {
            status = child.wait() => {
                return Err(exit_error(status));
            }
            event = incoming.recv() => {
                match event {
                    Some(event) => handle_incoming(conn, event, state, opts).await,
                    None => return Err("agent closed its output stream".to_string()),
                }
            }
            response = &mut prompt_fut => {
                let response = response.map_err(|e| format!("prompt failed: {}", e))?;
                // The reader forwards traffic in arrival order, so any update
                // sent before the prompt response is already buffered.
                while let Ok(event) = incoming.try_recv() {
                    handle_incoming(conn, event, state, opts).await;
                }
                let stop_reason = response
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .map(String::from);
                return Ok(stop_reason);
            }
        }
    }
}

/// Race `fut` against the child exiting underneath it.
async fn race_exit<T>(
    child: &mut Child,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, String> {
    tokio::select! {
        status = child.wait() => Err(exit_error(status)),
        value = fut => Ok(value),
    }
}

fn exit_error(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => format!("agent exited unexpectedly ({})", status),
        Err(e) => format!("agent exit watcher failed: {}", e),
    }
}

/// Match the requested model against the agent's advertised list, by id or
/// display name. Returns the id to pass to `setSessionModel`.
fn find_model(session: &Value, requested: &str) -> Option<String> {
    let models = session.get("models")?.as_array()?;
    for model in models {
        let id = model
            .get("modelId")
            .or_else(|| model.get("id"))
            .and_then(Value::as_str);
        let name = model
            .get("name")
            .or_else(|| model.get("displayName"))
            .and_then(Value::as_str);
        if id == Some(requested) || name == Some(requested) {
            return id.map(String::from);
        }
    }
    None
}

/// Handle one agent-initiated message during the prompt phase.
async fn handle_incoming(
    conn: &Arc<AgentConnection>,
    event: Incoming,
    state: &mut StreamState,
    opts: &SessionOptions,
) {
    match event {
        Incoming::Notification { method, params } => {
            if method == "session/update" {
                state.apply_update(&params, opts);
            } else {
                debug!(method = %method, "ignoring agent notification");
            }
        }
        Incoming::Request { id, method, params } => {
            if method == "session/request_permission" {
                let response = decide_permission(&params, opts);
                conn.respond(id, response).await;
            } else {
                conn.respond_error(id, -32601, &format!("Method not found: {}", method))
                    .await;
            }
        }
    }
}

/// Evaluate a permission request against the policy and pick an option id.
fn decide_permission(params: &Value, opts: &SessionOptions) -> Value {
    let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
    let tool_name = tool_call
        .get("name")
        .or_else(|| tool_call.get("title"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let tool_title = tool_call
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(&tool_name)
        .to_string();
    let args = tool_call
        .get("rawInput")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let verdict = opts.policy.evaluate(&PermissionContext {
        tool_name: tool_name.clone(),
        tool_title,
        args,
        project_root: opts.project_root.clone(),
    });

    let allow = match verdict.action {
        PermissionAction::Allow => true,
        PermissionAction::Deny => false,
        PermissionAction::Ask => opts.auto_approve,
    };

    let options = params
        .get("options")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let chosen = if allow {
        pick_option(&options, &["allow_once", "allow_always"], "allow")
    } else {
        pick_option(&options, &["deny", "reject_once", "reject_always"], "deny")
    };

    info!(
        tool = %tool_name,
        action = %verdict.action,
        option = chosen.as_deref().unwrap_or("-"),
        "permission decision: {}",
        verdict.reason
    );

    match chosen {
        Some(option_id) => json!({
            "outcome": { "outcome": "selected", "optionId": option_id }
        }),
        None => json!({ "outcome": { "outcome": "cancelled" } }),
    }
}

/// Prefer options by kind in the given order, falling back to a literal id.
fn pick_option(options: &[Value], kinds: &[&str], literal_id: &str) -> Option<String> {
    for kind in kinds {
        if let Some(option) = options
            .iter()
            .find(|o| o.get("kind").and_then(Value::as_str) == Some(*kind))
        {
            if let Some(id) = option.get("optionId").and_then(Value::as_str) {
                return Some(id.to_string());
            }
        }
    }
    options
        .iter()
        .find(|o| o.get("optionId").and_then(Value::as_str) == Some(literal_id))
        .map(|_| literal_id.to_string())
}

// ---------------------------------------------------------------------------
// Stream state — accumulates output across session updates
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StreamState {
    agent_output: String,
    tool_output: String,
    tool_calls: Vec<ToolCallRecord>,
}

/// Tool titles whose content is noise to the orchestrator (file reads).
fn read_title_filter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(read|cat|view|open|load).*(file|content|source)")
            .expect("title filter pattern is valid")
    })
}

impl StreamState {
    fn apply_update(&mut self, params: &Value, opts: &SessionOptions) {
        let update = params.get("update").unwrap_or(params);
        let kind = update
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match kind {
            "agent_message_chunk" => {
                if let Some(text) = content_text(update.get("content")) {
                    self.push_agent(&text);
                }
            }
            "agent_thought_chunk" => {
                if let Some(text) = content_text(update.get("content")) {
                    debug!("agent thought: {}", prefix_bytes(&text, 120));
                }
            }
            "tool_call" => {
                let record = ToolCallRecord {
                    id: update
                        .get("toolCallId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    title: update
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: update
                        .get("status")
                        .and_then(Value::as_str)
                        .map(String::from),
                };
                debug!(tool = %record.title, "tool call");
                self.tool_calls.push(record);
                if let Some(hooks) = opts.hooks.as_ref() {
                    hooks.on_tool_call(&opts.agent_name);
                }
                self.extract_tool_content(update);
            }
            "tool_call_update" => {
                self.extract_tool_content(update);
            }
            "plan" => {
                let entries = update
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|e| e.len())
                    .unwrap_or(0);
                debug!(entries = entries, "agent plan update");
            }
            other => {
                debug!(kind = other, "unhandled session update");
            }
        }
    }

    /// Pull orchestrator-relevant text out of a tool update.
    fn extract_tool_content(&mut self, update: &Value) {
        let title = update.get("title").and_then(Value::as_str).unwrap_or("");
        if read_title_filter().is_match(title) {
            return;
        }

        if let Some(items) = update.get("content").and_then(Value::as_array) {
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("content") => {
                        if let Some(text) = content_text(item.get("content")) {
                            self.push_tool(&text);
                        }
                    }
                    Some("diff") => {
                        let uri = item
                            .get("uri")
                            .or_else(|| item.get("path"))
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        let new_text = item
                            .get("newText")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        self.push_tool(&format!("[diff] {}\n{}", uri, new_text));
                    }
                    Some("terminal") => {
                        if let Some(output) = item.get("output").and_then(Value::as_str) {
                            self.push_tool(output);
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(raw) = update.get("rawOutput") {
            let serialized = raw.to_string();
            if !serialized.is_empty()
                && serialized != "null"
                && serialized.len() < RAW_OUTPUT_LIMIT
            {
                self.push_tool(&serialized);
            }
        }
    }

    fn push_agent(&mut self, text: &str) {
        if self.agent_output.len() >= MAX_AGENT_OUTPUT {
            return;
        }
        self.agent_output.push_str(text);
        if truncate_to(&mut self.agent_output, MAX_AGENT_OUTPUT) {
            warn!("agent output truncated to {} bytes", MAX_AGENT_OUTPUT);
        }
    }

    fn push_tool(&mut self, text: &str) {
        if self.tool_output.len() >= MAX_TOOL_OUTPUT {
            return;
        }
        if !self.tool_output.is_empty() {
            self.tool_output.push('\n');
        }
        self.tool_output.push_str(text);
        if truncate_to(&mut self.tool_output, MAX_TOOL_OUTPUT) {
            warn!("tool output truncated to {} bytes", MAX_TOOL_OUTPUT);
        }
    }

    /// Merge agent-message output with tool-extracted output.
    fn merged_output(&self) -> String {
        let agent = self.agent_output.trim_end();
        let tool = self.tool_output.trim_end();

        if agent.len() > 500 && tool.len() > 100 {
            let probe = prefix_bytes(tool, 200);
            if !agent.contains(probe) {
                return format!("{}\n\n--- Tool Output ---\n{}", agent, tool);
            }
        }
        if agent.len() > 500 {
            return agent.to_string();
        }
        if !tool.is_empty() {
            return format!("{}\n\n```\n{}\n```", agent, tool);
        }
        agent.to_string()
    }
}

/// Extract text from an ACP content block (object, array, or bare string).
fn content_text(content: Option<&Value>) -> Option<String> {
    let content = content?;
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("text").and_then(Value::as_str).map(String::from),
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            (!out.is_empty()).then_some(out)
        }
        _ => None,
    }
}

/// Largest prefix of `s` at most `cap` bytes, on a char boundary.
fn prefix_bytes(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn tail_of(buf: &Arc<Mutex<String>>, cap: usize) -> String {
    let guard = buf.lock().unwrap_or_else(|e| e.into_inner());
    let s = guard.trim_end();
    if s.len() <= cap {
        return s.to_string();
    }
    let mut start = s.len() - cap;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// SIGTERM, wait up to the grace period, then SIGKILL and reap.
async fn teardown(child: &mut Child, pid: Option<u32>) {
    match pid {
        Some(pid) => process::sigterm(pid),
        None => {
            let _ = child.start_kill();
        }
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        if let Some(pid) = pid {
            process::sigkill(pid);
        } else {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
    }
}
