//! Core domain types for Teambridge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Agent output buffer cap.
pub const MAX_AGENT_OUTPUT: usize = 128 * 1024;
/// Tool-extracted output buffer cap.
pub const MAX_TOOL_OUTPUT: usize = 64 * 1024;
/// Stderr capture cap.
pub const MAX_STDERR: usize = 64 * 1024;
/// Bus message content cap.
pub const MAX_MESSAGE_CONTENT: usize = 64 * 1024;
/// Per-inbox message-count cap; the oldest files are pruned above this.
pub const INBOX_CAP: usize = 500;
/// Broadcast recipient sentinel.
pub const BROADCAST_TO: &str = "all";
/// Synthetic sender name for orchestrator-originated messages.
pub const ORCHESTRATOR_SENDER: &str = "orchestrator";

/// Truncate `s` in place to at most `cap` bytes, cutting back to the nearest
/// char boundary. Returns true if anything was removed.
pub fn truncate_to(s: &mut String, cap: usize) -> bool {
    if s.len() <= cap {
        return false;
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    true
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Lifecycle state of a single agent invocation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// A single agent invocation tracked by the bridge.
///
/// Invariants: exactly one terminal transition; `completed_at` is set iff the
/// status is terminal; the owning process handle (held by the server's task
/// table, not here) is released on the terminal transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent: String,
    pub model: String,
    pub project: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error: Option<String>,
    pub tool_calls: u32,
    pub output_bytes: u64,
    pub team: Option<String>,
}

impl Task {
    pub fn new(
        agent: impl Into<String>,
        model: impl Into<String>,
        project: impl Into<String>,
        prompt: impl Into<String>,
        team: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent: agent.into(),
            model: model.into(),
            project: project.into(),
            prompt: prompt.into(),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            output: String::new(),
            error: None,
            tool_calls: 0,
            output_bytes: 0,
            team,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// One node in a workflow DAG.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    pub agent: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A named DAG of steps to run against one project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub project: String,
    pub steps: Vec<StepDef>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, project: impl Into<String>, steps: Vec<StepDef>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            project: project.into(),
            steps,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Per-step execution record inside a workflow run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of the backing task, when the runner created one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Default for StepResult {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: String::new(),
            error: None,
            task_id: None,
        }
    }
}

/// Snapshot of a workflow run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub steps: HashMap<String, StepResult>,
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Request,
    Response,
    Nudge,
    Broadcast,
    Shutdown,
}

/// One bus message, persisted as a single JSON file in the recipient inbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    pub to: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub read: bool,
}

/// Open-request claim primitive between agents (distinct from `Task`).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Open,
    Claimed,
    Completed,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    pub from: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
}

impl TaskRequest {
    /// Whether the claim window has elapsed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        (now - self.created_at).num_seconds() > self.timeout_seconds as i64
    }
}

// ---------------------------------------------------------------------------
// Agent registry
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Idle,
    Waiting,
    Dead,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Waiting => write!(f, "waiting"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Presence record for one registered agent. Name is the primary key;
/// re-registration replaces the prior entry atomically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRegistryEntry {
    pub name: String,
    pub status: AgentStatus,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub pending_messages: u32,
    #[serde(default)]
    pub open_requests: u32,
}

// ---------------------------------------------------------------------------
// Session supervisor
// ---------------------------------------------------------------------------

/// How to start one agent process.
#[derive(Clone, Debug)]
pub struct SpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// One tool call observed during a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Outcome of one end-to-end agent session. The supervisor never raises;
/// every exit path lands here with `error` set on failure.
#[derive(Clone, Debug, Default)]
pub struct AcpResult {
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
    pub stop_reason: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl AcpResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trip() {
        for status in [
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn truncate_to_exact_cap() {
        let mut s = "a".repeat(100);
        assert!(truncate_to(&mut s, 64));
        assert_eq!(s.len(), 64);
        assert!(!truncate_to(&mut s, 64));
    }

    #[test]
    fn truncate_to_respects_char_boundary() {
        let mut s = "é".repeat(40); // 2 bytes each
        assert!(truncate_to(&mut s, 33));
        assert_eq!(s.len(), 32);
    }

    #[test]
    fn new_task_starts_running() {
        let task = Task::new("droid", "gpt-5", "proj", "do it", None);
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.completed_at.is_none());
        assert_eq!(task.id.len(), 36);
    }

    #[test]
    fn request_overdue() {
        let mut req = TaskRequest {
            id: "r1".into(),
            from: "a".into(),
            description: "d".into(),
            context: None,
            status: RequestStatus::Open,
            created_at: Utc::now() - chrono::Duration::seconds(45),
            claimed_by: None,
            claimed_at: None,
            timeout_seconds: 30,
        };
        assert!(req.is_overdue(Utc::now()));
        req.timeout_seconds = 60;
        assert!(!req.is_overdue(Utc::now()));
    }

    #[test]
    fn message_kind_serde_uses_type_field() {
        let msg = Message {
            id: "m1".into(),
            kind: MessageKind::Broadcast,
            from: "orchestrator".into(),
            to: "all".into(),
            content: "ping".into(),
            timestamp: Utc::now(),
            request_id: None,
            reply_to: None,
            read: false,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "broadcast");
    }
}
