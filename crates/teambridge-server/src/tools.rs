//! The 14-tool catalogue and typed argument parsing
//!
//! Incoming `tools/call` arguments are loosely typed JSON; they are parsed
//! into one tagged union so every handler works with concrete structs and
//! mismatches surface as validation errors.

use serde::Deserialize;
use serde_json::{json, Value};
use teambridge_core::{Error, Result};

/// Limits applied during argument validation.
pub const MAX_AGENT_NAME_BYTES: usize = 256;
pub const MAX_PROJECT_BYTES: usize = 256;
pub const MAX_PROMPT_BYTES: usize = 100 * 1024;

#[derive(Clone, Debug, Deserialize)]
pub struct AssignTaskParams {
    pub agent: String,
    pub prompt: String,
    pub project: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub wait: Option<bool>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TaskIdParams {
    pub task_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BroadcastParams {
    pub content: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AgentMessageParams {
    pub agent: String,
    pub content: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AgentNameParams {
    pub agent: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowStepParams {
    pub name: String,
    pub agent: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateWorkflowParams {
    pub name: String,
    pub project: String,
    pub steps: Vec<WorkflowStepParams>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowIdParams {
    pub workflow_id: String,
}

/// Tagged union over the tool names.
#[derive(Clone, Debug)]
pub enum ToolCall {
    ListAgents,
    AssignTask(AssignTaskParams),
    GetTaskStatus(TaskIdParams),
    GetTaskResult(TaskIdParams),
    CancelTask(TaskIdParams),
    GetMetrics,
    HealthCheck,
    Broadcast(BroadcastParams),
    SendAgentMessage(AgentMessageParams),
    GetAgentStatus,
    ShutdownAgent(AgentNameParams),
    KillAgent(AgentNameParams),
    CreateWorkflow(CreateWorkflowParams),
    GetWorkflowStatus(WorkflowIdParams),
}

impl ToolCall {
    /// Parse `tools/call` arguments for `name` into the union.
    pub fn parse(name: &str, arguments: &Value) -> Result<Self> {
        fn params<T: serde::de::DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T> {
            serde_json::from_value(arguments.clone())
                .map_err(|e| Error::Validation(format!("invalid arguments for {}: {}", tool, e)))
        }

        let call = match name {
            "list_agents" => Self::ListAgents,
            "assign_task" => {
                let p: AssignTaskParams = params(name, arguments)?;
                validate_assign_task(&p)?;
                Self::AssignTask(p)
            }
            "get_task_status" => {
                let p: TaskIdParams = params(name, arguments)?;
                validate_task_id(&p.task_id)?;
                Self::GetTaskStatus(p)
            }
            "get_task_result" => {
                let p: TaskIdParams = params(name, arguments)?;
                validate_task_id(&p.task_id)?;
                Self::GetTaskResult(p)
            }
            "cancel_task" => {
                let p: TaskIdParams = params(name, arguments)?;
                validate_task_id(&p.task_id)?;
                Self::CancelTask(p)
            }
            "get_metrics" => Self::GetMetrics,
            "health_check" => Self::HealthCheck,
            "broadcast" => {
                let p: BroadcastParams = params(name, arguments)?;
                require_non_empty("content", &p.content)?;
                Self::Broadcast(p)
            }
            "send_agent_message" => {
                let p: AgentMessageParams = params(name, arguments)?;
                require_non_empty("agent", &p.agent)?;
                require_non_empty("content", &p.content)?;
                Self::SendAgentMessage(p)
            }
            "get_agent_status" => Self::GetAgentStatus,
            "shutdown_agent" => {
                let p: AgentNameParams = params(name, arguments)?;
                require_non_empty("agent", &p.agent)?;
                Self::ShutdownAgent(p)
            }
            "kill_agent" => {
                let p: AgentNameParams = params(name, arguments)?;
                require_non_empty("agent", &p.agent)?;
                Self::KillAgent(p)
            }
            "create_workflow" => {
                let p: CreateWorkflowParams = params(name, arguments)?;
                require_non_empty("name", &p.name)?;
                validate_project_string(&p.project)?;
                if p.steps.is_empty() {
                    return Err(Error::Validation("workflow needs at least one step".into()));
                }
                Self::CreateWorkflow(p)
            }
            "get_workflow_status" => {
                let p: WorkflowIdParams = params(name, arguments)?;
                require_non_empty("workflow_id", &p.workflow_id)?;
                Self::GetWorkflowStatus(p)
            }
            other => return Err(Error::MethodNotFound(format!("unknown tool '{}'", other))),
        };
        Ok(call)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn validate_assign_task(p: &AssignTaskParams) -> Result<()> {
    require_non_empty("agent", &p.agent)?;
    if p.agent.len() > MAX_AGENT_NAME_BYTES {
        return Err(Error::Validation(format!(
            "agent name exceeds {} bytes",
            MAX_AGENT_NAME_BYTES
        )));
    }
    require_non_empty("prompt", &p.prompt)?;
    if p.prompt.len() > MAX_PROMPT_BYTES {
        return Err(Error::Validation(format!(
            "prompt exceeds {} bytes",
            MAX_PROMPT_BYTES
        )));
    }
    validate_project_string(&p.project)
}

fn validate_project_string(project: &str) -> Result<()> {
    require_non_empty("project", project)?;
    if project.len() > MAX_PROJECT_BYTES {
        return Err(Error::Validation(format!(
            "project exceeds {} bytes",
            MAX_PROJECT_BYTES
        )));
    }
    if project.bytes().any(|b| b.is_ascii_control()) {
        return Err(Error::Validation(
            "project must not contain control characters".into(),
        ));
    }
    Ok(())
}

/// Task ids are 8-36 chars of `[a-f0-9-]`.
pub fn validate_task_id(id: &str) -> Result<()> {
    let ok = (8..=36).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b) || b == b'-');
    if !ok {
        return Err(Error::Validation(format!("invalid task id '{}'", id)));
    }
    Ok(())
}

/// Static tool catalogue with JSON-schema input definitions, served by
/// `tools/list`.
pub fn tool_catalogue() -> Value {
    let task_id_schema = json!({
        "type": "object",
        "properties": {
            "task_id": { "type": "string", "pattern": "^[a-f0-9-]{8,36}$" }
        },
        "required": ["task_id"]
    });
    let agent_schema = json!({
        "type": "object",
        "properties": { "agent": { "type": "string" } },
        "required": ["agent"]
    });
    let empty_schema = json!({ "type": "object", "properties": {} });

    json!([
        {
            "name": "list_agents",
            "description": "List configured agents with availability, models, and strengths",
            "inputSchema": empty_schema,
        },
        {
            "name": "assign_task",
            "description": "Run a prompt against an agent in a project directory",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "agent": { "type": "string", "description": "Configured agent name" },
                    "prompt": { "type": "string", "description": "Task prompt" },
                    "project": { "type": "string", "description": "Project path relative to the workspace root" },
                    "model": { "type": "string", "description": "Model id (defaults to the agent's default model)" },
                    "team": { "type": "string", "description": "Optional team tag" },
                    "wait": { "type": "boolean", "description": "Wait for completion (default false)" },
                    "timeout_seconds": { "type": "integer", "description": "Synchronous wait limit, capped at 1800" }
                },
                "required": ["agent", "prompt", "project"]
            },
        },
        {
            "name": "get_task_status",
            "description": "Current status of a task",
            "inputSchema": task_id_schema,
        },
        {
            "name": "get_task_result",
            "description": "Last-known output and error of a task",
            "inputSchema": task_id_schema,
        },
        {
            "name": "cancel_task",
            "description": "Cancel a running task and terminate its agent process",
            "inputSchema": task_id_schema,
        },
        {
            "name": "get_metrics",
            "description": "Bridge uptime, totals, per-agent counters, and operational counters",
            "inputSchema": empty_schema,
        },
        {
            "name": "health_check",
            "description": "Bridge health, agent availability, and limits",
            "inputSchema": empty_schema,
        },
        {
            "name": "broadcast",
            "description": "Broadcast a message to every registered agent",
            "inputSchema": {
                "type": "object",
                "properties": { "content": { "type": "string" } },
                "required": ["content"]
            },
        },
        {
            "name": "send_agent_message",
            "description": "Send a direct message to one registered agent",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "agent": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["agent", "content"]
            },
        },
        {
            "name": "get_agent_status",
            "description": "Registry status of every agent with pending message counts",
            "inputSchema": empty_schema,
        },
        {
            "name": "shutdown_agent",
            "description": "Ask an agent to shut down via a bus message",
            "inputSchema": agent_schema,
        },
        {
            "name": "kill_agent",
            "description": "Terminate an agent process and mark it dead",
            "inputSchema": agent_schema,
        },
        {
            "name": "create_workflow",
            "description": "Run a DAG of dependent steps across agents",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "project": { "type": "string" },
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "agent": { "type": "string" },
                                "prompt": { "type": "string" },
                                "model": { "type": "string" },
                                "depends_on": { "type": "array", "items": { "type": "string" } }
                            },
                            "required": ["name", "agent", "prompt"]
                        }
                    }
                },
                "required": ["name", "project", "steps"]
            },
        },
        {
            "name": "get_workflow_status",
            "description": "Snapshot of a workflow's step states",
            "inputSchema": {
                "type": "object",
                "properties": { "workflow_id": { "type": "string" } },
                "required": ["workflow_id"]
            },
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_has_all_fourteen_tools() {
        let catalogue = tool_catalogue();
        let names: Vec<&str> = catalogue
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names.len(), 14);
        for expected in [
            "list_agents",
            "assign_task",
            "get_task_status",
            "get_task_result",
            "cancel_task",
            "get_metrics",
            "health_check",
            "broadcast",
            "send_agent_message",
            "get_agent_status",
            "shutdown_agent",
            "kill_agent",
            "create_workflow",
            "get_workflow_status",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
    }

    #[test]
    fn unknown_tool_rejected() {
        let err = ToolCall::parse("launch_missiles", &json!({})).unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }

    #[test]
    fn assign_task_parses_and_validates() {
        let ok = ToolCall::parse(
            "assign_task",
            &json!({ "agent": "droid", "prompt": "echo hi", "project": "proj" }),
        )
        .unwrap();
        assert!(matches!(ok, ToolCall::AssignTask(_)));

        for bad in [
            json!({ "prompt": "x", "project": "p" }),
            json!({ "agent": "", "prompt": "x", "project": "p" }),
            json!({ "agent": "a", "prompt": "", "project": "p" }),
            json!({ "agent": "a", "prompt": "x", "project": "" }),
            json!({ "agent": "a", "prompt": "x", "project": "pro\u{7}ject" }),
        ] {
            assert!(ToolCall::parse("assign_task", &bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn oversized_fields_rejected() {
        let long_agent = "a".repeat(MAX_AGENT_NAME_BYTES + 1);
        assert!(ToolCall::parse(
            "assign_task",
            &json!({ "agent": long_agent, "prompt": "x", "project": "p" }),
        )
        .is_err());

        let long_prompt = "p".repeat(MAX_PROMPT_BYTES + 1);
        assert!(ToolCall::parse(
            "assign_task",
            &json!({ "agent": "a", "prompt": long_prompt, "project": "p" }),
        )
        .is_err());
    }

    #[test]
    fn task_id_pattern_enforced() {
        assert!(validate_task_id("abcd1234").is_ok());
        assert!(validate_task_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_task_id("short").is_err());
        assert!(validate_task_id("UPPERCASE0").is_err());
        assert!(validate_task_id("has space 123").is_err());
        assert!(validate_task_id(&"a".repeat(37)).is_err());
    }

    #[test]
    fn create_workflow_requires_steps() {
        let err = ToolCall::parse(
            "create_workflow",
            &json!({ "name": "w", "project": "p", "steps": [] }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }
}
