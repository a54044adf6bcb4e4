//! Tool handlers — one function per bridge tool
//!
//! Handlers return `Result<Value>`; the server wraps values into the
//! `tools/call` result shape and errors into `isError:true` responses.
//! Caller mistakes (validation, admission) are surfaced without
//! error-severity logging.

use crate::hooks::BridgeHooks;
use crate::state::{
    SharedState, TaskEntry, DEFAULT_WAIT_SECS, MAX_GLOBAL_RUNNING, MAX_PER_AGENT_RUNNING,
    MAX_WAIT_SECS, PRUNE_GRACE_MS, RETENTION_MS, TASK_TABLE_CAP,
};
use crate::tools::*;
use crate::workflow::{StepOutcome, StepRunner};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use teambridge_acp::{build_env, process, run_session, SessionOptions, KILL_GRACE, SESSION_TIMEOUT};
use teambridge_core::{
    AcpResult, AgentConfig, AgentStatus, Error, MessageKind, Result, SpawnConfig, StepDef, Task,
    TaskStatus, WorkflowDefinition, BROADCAST_TO, ORCHESTRATOR_SENDER,
};
use teambridge_bus::MessageOptions;
use teambridge_store::TaskPatch;
use tracing::{error, info, warn};

/// Route a parsed tool call to its handler.
pub async fn dispatch(state: &SharedState, call: ToolCall) -> Result<Value> {
    match call {
        ToolCall::ListAgents => list_agents(state).await,
        ToolCall::AssignTask(p) => assign_task(state, p).await,
        ToolCall::GetTaskStatus(p) => get_task_status(state, p).await,
        ToolCall::GetTaskResult(p) => get_task_result(state, p).await,
        ToolCall::CancelTask(p) => cancel_task(state, p).await,
        ToolCall::GetMetrics => get_metrics(state).await,
        ToolCall::HealthCheck => health_check(state).await,
        ToolCall::Broadcast(p) => broadcast(state, p).await,
        ToolCall::SendAgentMessage(p) => send_agent_message(state, p).await,
        ToolCall::GetAgentStatus => get_agent_status(state).await,
        ToolCall::ShutdownAgent(p) => shutdown_agent(state, p).await,
        ToolCall::KillAgent(p) => kill_agent(state, p).await,
        ToolCall::CreateWorkflow(p) => create_workflow(state, p).await,
        ToolCall::GetWorkflowStatus(p) => get_workflow_status(state, p).await,
    }
}

// ---------------------------------------------------------------------------
// list_agents
// ---------------------------------------------------------------------------

/// Availability: `acp` agents need their command on PATH; anything else
/// needs at least one model with its API-key variable present.
fn agent_available(config: &AgentConfig) -> bool {
    if config.agent_type == "acp" {
        which::which(&config.command).is_ok()
    } else {
        config
            .key_env_vars()
            .iter()
            .any(|key| std::env::var(key).is_ok())
    }
}

async fn list_agents(state: &SharedState) -> Result<Value> {
    let config = state.config.read().await;
    let mut agents = serde_json::Map::new();
    for (name, agent) in &config.agents {
        agents.insert(
            name.clone(),
            json!({
                "available": agent_available(agent),
                "defaultModel": agent.default_model,
                "availableModels": agent.model_names(),
                "strengths": agent.strengths,
                "type": agent.agent_type,
            }),
        );
    }
    Ok(json!({ "agents": agents }))
}

// ---------------------------------------------------------------------------
// assign_task
// ---------------------------------------------------------------------------

async fn assign_task(state: &SharedState, p: AssignTaskParams) -> Result<Value> {
    let project_dir = state.resolve_project(&p.project)?;
    if !project_dir.is_dir() {
        return Err(Error::Validation(format!(
            "project directory '{}' does not exist",
            p.project
        )));
    }

    let (effective_agent, agent_cfg, auto_approve) = {
        let config = state.config.read().await;
        let (name, cfg) = resolve_agent(&config.agents, &p.agent)?;
        (name, cfg, config.permissions.auto_approve)
    };

    // Admission
    let global = state.running_task_count();
    if global >= MAX_GLOBAL_RUNNING {
        return Err(Error::Admission(format!(
            "{} tasks already in flight (limit {})",
            global, MAX_GLOBAL_RUNNING
        )));
    }
    let per_agent = state.running_task_count_for(&effective_agent);
    if per_agent >= MAX_PER_AGENT_RUNNING {
        return Err(Error::Admission(format!(
            "agent '{}' already has {} running tasks (limit {})",
            effective_agent, per_agent, MAX_PER_AGENT_RUNNING
        )));
    }

    // Model validation: invalid requests warn and fall back to the default
    let model = match p.model.as_deref() {
        Some(m) if agent_cfg.has_model(m) => m.to_string(),
        Some(m) => {
            warn!(
                agent = %effective_agent,
                model = m,
                "unknown model requested, using default '{}'",
                agent_cfg.default_model
            );
            agent_cfg.default_model.clone()
        }
        None => agent_cfg.default_model.clone(),
    };

    let task = Task::new(&effective_agent, &model, &p.project, &p.prompt, p.team);
    state.store.save(&task)?;
    state.tasks.insert(
        task.id.clone(),
        TaskEntry {
            task: task.clone(),
            pid: None,
        },
    );
    state.metrics.task_assigned(&effective_agent);
    info!(task = %task.id, agent = %effective_agent, model = %model, "task assigned");

    let spawn_config = build_spawn_config(&agent_cfg, &model, &project_dir);
    let done = start_supervisor(state.clone(), task.clone(), spawn_config, auto_approve);

    if p.wait.unwrap_or(false) {
        let wait = Duration::from_secs(
            p.timeout_seconds
                .unwrap_or(DEFAULT_WAIT_SECS)
                .min(MAX_WAIT_SECS),
        );
        let _ = tokio::time::timeout(wait, done).await;
    }

    let entry = state
        .tasks
        .get(&task.id)
        .ok_or_else(|| Error::TaskNotFound(task.id.clone()))?;
    Ok(task_result_payload(&entry.task))
}

/// Look up the agent, falling back when it is unavailable and a fallback is
/// configured and available.
fn resolve_agent(
    agents: &std::collections::HashMap<String, AgentConfig>,
    requested: &str,
) -> Result<(String, AgentConfig)> {
    let cfg = agents
        .get(requested)
        .ok_or_else(|| Error::AgentNotFound(requested.to_string()))?;
    if agent_available(cfg) {
        return Ok((requested.to_string(), cfg.clone()));
    }
    if let Some(fallback) = &cfg.fallback_agent {
        if let Some(fallback_cfg) = agents.get(fallback) {
            if agent_available(fallback_cfg) {
                info!(
                    requested = requested,
                    fallback = %fallback,
                    "agent unavailable, switching to fallback"
                );
                return Ok((fallback.clone(), fallback_cfg.clone()));
            }
        }
    }
    Err(Error::Admission(format!(
        "agent '{}' is not available",
        requested
    )))
}

fn build_spawn_config(cfg: &AgentConfig, model: &str, project_dir: &Path) -> SpawnConfig {
    let mut args = cfg.args.clone();
    if let Some(model_cfg) = cfg.models.get(model) {
        if let Some(flag) = &model_cfg.flag {
            args.push(flag.clone());
            if let Some(value) = &model_cfg.value {
                args.push(value.clone());
            }
        }
    }

    let key_vars: Vec<String> = cfg
        .key_env_vars()
        .into_iter()
        .map(String::from)
        .collect();
    let mut env = build_env(&key_vars);
    if let Some(extra) = &cfg.env {
        for (k, v) in extra {
            env.insert(k.clone(), v.clone());
        }
    }

    SpawnConfig {
        command: cfg.command.clone(),
        args,
        cwd: project_dir.to_path_buf(),
        env,
    }
}

/// Run the supervisor for `task` in the background, finalizing on return.
/// The returned receiver resolves when finalization is done.
fn start_supervisor(
    state: SharedState,
    task: Task,
    spawn_config: SpawnConfig,
    auto_approve: bool,
) -> tokio::sync::oneshot::Receiver<()> {
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let result = run_task_session(&state, &task, spawn_config, auto_approve).await;
        finalize_task(&state, &task.id, result);
        let _ = done_tx.send(());
    });
    done_rx
}

/// Drive one supervised session for an existing task row.
async fn run_task_session(
    state: &SharedState,
    task: &Task,
    spawn_config: SpawnConfig,
    auto_approve: bool,
) -> AcpResult {
    let hooks = Arc::new(BridgeHooks {
        state: state.clone(),
        task_id: task.id.clone(),
        agent: task.agent.clone(),
        model: task.model.clone(),
    });
    let opts = SessionOptions {
        agent_name: task.agent.clone(),
        model: Some(task.model.clone()),
        prompt: task.prompt.clone(),
        project_root: spawn_config.cwd.clone(),
        policy: state.policy.clone(),
        auto_approve,
        hooks: Some(hooks),
        session_timeout: SESSION_TIMEOUT,
    };
    run_session(spawn_config, opts).await
}

/// Write the terminal state everywhere: task table, store, metrics,
/// registry, and the pruning pass.
pub(crate) fn finalize_task(state: &SharedState, task_id: &str, result: AcpResult) {
    let finalized = {
        let Some(mut entry) = state.tasks.get_mut(task_id) else {
            warn!(task = task_id, "finalize for unknown task");
            return;
        };
        entry.pid = None;
        if entry.task.status.is_terminal() {
            // Cancelled (or otherwise finalized) while the session wound down
            None
        } else {
            let status = if result.error.is_some() {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            };
            entry.task.status = status;
            entry.task.completed_at = Some(Utc::now());
            entry.task.output = result.output.clone();
            entry.task.error = result.error.clone();
            entry.task.output_bytes = result.output.len() as u64;
            entry.task.tool_calls = entry.task.tool_calls.max(result.tool_calls.len() as u32);
            Some(entry.task.clone())
        }
    };
    let Some(task) = finalized else { return };

    if result.timed_out {
        state.metrics.agent_timeout();
    }
    if result
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("spawn failed"))
    {
        state.metrics.agent_spawn_failure();
    }

    let duration_ms = task.duration_ms().max(0) as u64;
    match task.status {
        TaskStatus::Completed => {
            state.metrics.task_completed(&task.agent, duration_ms);
            state
                .registry
                .update_status(&task.agent, AgentStatus::Idle, None);
        }
        _ => state.metrics.task_failed(&task.agent, duration_ms),
    }

    let patch = TaskPatch::finish(
        task.status,
        task.output.clone(),
        task.error.clone(),
        task.tool_calls,
    );
    if let Err(e) = state.store.update(&task.id, &patch) {
        error!(task = %task.id, "cannot persist terminal task state: {}", e);
    }

    info!(
        task = %task.id,
        agent = %task.agent,
        status = %task.status,
        duration_ms = duration_ms,
        output_bytes = task.output_bytes,
        "task finalized"
    );

    prune_tasks(state);
    if let Err(e) = state.store.prune(RETENTION_MS) {
        warn!("store prune failed: {}", e);
    }
}

/// Keep the in-memory table at or below the cap: drop terminal tasks whose
/// completion age exceeds both the grace and the retention. Running tasks
/// are never dropped.
fn prune_tasks(state: &SharedState) {
    if state.tasks.len() <= TASK_TABLE_CAP {
        return;
    }
    let now = Utc::now();
    let stale: Vec<String> = state
        .tasks
        .iter()
        .filter_map(|entry| {
            if !entry.task.status.is_terminal() {
                return None;
            }
            let done = entry.task.completed_at?;
            let age_ms = (now - done).num_milliseconds();
            (age_ms > PRUNE_GRACE_MS && age_ms > RETENTION_MS).then(|| entry.task.id.clone())
        })
        .collect();
    if !stale.is_empty() {
        info!(count = stale.len(), "pruning finished tasks from memory");
        for id in stale {
            state.tasks.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Task queries
// ---------------------------------------------------------------------------

fn load_task(state: &SharedState, task_id: &str) -> Result<Task> {
    if let Some(entry) = state.tasks.get(task_id) {
        return Ok(entry.task.clone());
    }
    state
        .store
        .get(task_id)?
        .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
}

fn task_status_payload(task: &Task) -> Value {
    json!({
        "task_id": task.id,
        "status": task.status,
        "agent": task.agent,
        "model": task.model,
        "project": task.project,
        "team": task.team,
        "started_at": task.started_at,
        "completed_at": task.completed_at,
        "tool_calls": task.tool_calls,
        "duration_ms": task.duration_ms(),
    })
}

fn task_result_payload(task: &Task) -> Value {
    json!({
        "task_id": task.id,
        "status": task.status,
        "agent": task.agent,
        "model": task.model,
        "output": task.output,
        "error": task.error,
        "duration_ms": task.duration_ms(),
    })
}

async fn get_task_status(state: &SharedState, p: TaskIdParams) -> Result<Value> {
    let task = load_task(state, &p.task_id)?;
    Ok(task_status_payload(&task))
}

async fn get_task_result(state: &SharedState, p: TaskIdParams) -> Result<Value> {
    let task = load_task(state, &p.task_id)?;
    Ok(task_result_payload(&task))
}

// ---------------------------------------------------------------------------
// cancel_task
// ---------------------------------------------------------------------------

async fn cancel_task(state: &SharedState, p: TaskIdParams) -> Result<Value> {
    let pid = {
        let Some(mut entry) = state.tasks.get_mut(&p.task_id) else {
            // Terminal tasks may only live in the store
            return match state.store.get(&p.task_id)? {
                Some(task) => Err(Error::Validation(format!(
                    "task {} is {} and cannot be cancelled",
                    p.task_id, task.status
                ))),
                None => Err(Error::TaskNotFound(p.task_id.clone())),
            };
        };
        if entry.task.status.is_terminal() {
            return Err(Error::Validation(format!(
                "task {} is {} and cannot be cancelled",
                p.task_id, entry.task.status
            )));
        }
        entry.task.status = TaskStatus::Cancelled;
        entry.task.completed_at = Some(Utc::now());
        entry.task.error = Some("cancelled by orchestrator".to_string());
        entry.pid.take()
    };

    // Kill is best-effort: a task with no attached process still cancels
    if let Some(pid) = pid {
        tokio::spawn(process::terminate_with_grace(pid, KILL_GRACE));
    }

    let task = state
        .tasks
        .get(&p.task_id)
        .map(|e| e.task.clone())
        .ok_or_else(|| Error::TaskNotFound(p.task_id.clone()))?;
    state.metrics.task_cancelled(&task.agent);
    let patch = TaskPatch {
        status: Some(TaskStatus::Cancelled),
        completed_at: task.completed_at,
        error: Some(task.error.clone()),
        ..Default::default()
    };
    state.store.update(&p.task_id, &patch)?;
    info!(task = %p.task_id, "task cancelled");

    Ok(json!({ "task_id": p.task_id, "status": "cancelled" }))
}

// ---------------------------------------------------------------------------
// get_metrics / health_check
// ---------------------------------------------------------------------------

async fn get_metrics(state: &SharedState) -> Result<Value> {
    Ok(state.metrics.snapshot(state.running_task_count()))
}

async fn health_check(state: &SharedState) -> Result<Value> {
    let config = state.config.read().await;
    let mut available = Vec::new();
    let mut unavailable = Vec::new();
    for (name, agent) in &config.agents {
        if agent_available(agent) {
            available.push(name.clone());
        } else {
            unavailable.push(name.clone());
        }
    }
    available.sort();
    unavailable.sort();
    let healthy = !available.is_empty();

    Ok(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "healthy": healthy,
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
        "active_tasks": state.running_task_count(),
        "agents": {
            "available": available,
            "unavailable": unavailable,
            "total": config.agents.len(),
        },
        "limits": {
            "max_concurrent_tasks": MAX_GLOBAL_RUNNING,
            "max_tasks_per_agent": MAX_PER_AGENT_RUNNING,
            "session_timeout_seconds": SESSION_TIMEOUT.as_secs(),
            "sync_wait_max_seconds": MAX_WAIT_SECS,
        },
    }))
}

// ---------------------------------------------------------------------------
// Messaging tools
// ---------------------------------------------------------------------------

async fn broadcast(state: &SharedState, p: BroadcastParams) -> Result<Value> {
    let message = state.bus.write_message(
        ORCHESTRATOR_SENDER,
        BROADCAST_TO,
        &p.content,
        MessageOptions::kind(MessageKind::Broadcast),
    )?;
    Ok(json!({ "message_id": message.id, "sent": true }))
}

async fn send_agent_message(state: &SharedState, p: AgentMessageParams) -> Result<Value> {
    if state.registry.get(&p.agent).is_none() {
        return Err(Error::AgentNotFound(p.agent));
    }
    let message = state.bus.write_message(
        ORCHESTRATOR_SENDER,
        &p.agent,
        &p.content,
        MessageOptions::default(),
    )?;
    Ok(json!({ "message_id": message.id, "sent": true }))
}

async fn get_agent_status(state: &SharedState) -> Result<Value> {
    let died = state.registry.detect_dead();
    if !died.is_empty() {
        warn!(agents = ?died, "dead agents detected");
    }

    let agents: Vec<Value> = state
        .registry
        .get_all()
        .into_iter()
        .map(|entry| {
            let messages_pending = state.bus.get_unread_count(&entry.name);
            let requests_pending = state.bus.open_request_count(&entry.name);
            state.registry.update_message_counts(
                &entry.name,
                messages_pending as u32,
                requests_pending as u32,
            );
            json!({
                "name": entry.name,
                "status": entry.status,
                "model": entry.model,
                "current_task": entry.current_task,
                "pid": entry.pid,
                "registered_at": entry.registered_at,
                "last_heartbeat": entry.last_heartbeat,
                "last_activity": entry.last_activity,
                "messages_pending": messages_pending,
                "requests_pending": requests_pending,
                "uptime_seconds": state.registry.uptime_seconds(&entry.name).unwrap_or(0),
            })
        })
        .collect();
    Ok(json!({ "agents": agents }))
}

async fn shutdown_agent(state: &SharedState, p: AgentNameParams) -> Result<Value> {
    state.bus.write_message(
        ORCHESTRATOR_SENDER,
        &p.agent,
        "shutdown requested by orchestrator",
        MessageOptions::kind(MessageKind::Shutdown),
    )?;
    info!(agent = %p.agent, "shutdown message sent");
    Ok(json!({ "agent": p.agent, "shutdown_sent": true }))
}

async fn kill_agent(state: &SharedState, p: AgentNameParams) -> Result<Value> {
    let entry = state
        .registry
        .get(&p.agent)
        .ok_or_else(|| Error::AgentNotFound(p.agent.clone()))?;

    if let Some(pid) = entry.pid {
        tokio::spawn(process::terminate_with_grace(pid, KILL_GRACE));
        info!(agent = %p.agent, pid = pid, "agent process terminated");
    }
    // Mark dead even when there was no live process to signal
    state
        .registry
        .update_status(&p.agent, AgentStatus::Dead, None);
    Ok(json!({ "agent": p.agent, "killed": true }))
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

async fn create_workflow(state: &SharedState, p: CreateWorkflowParams) -> Result<Value> {
    let project_dir = state.resolve_project(&p.project)?;
    if !project_dir.is_dir() {
        return Err(Error::Validation(format!(
            "project directory '{}' does not exist",
            p.project
        )));
    }

    let auto_approve = {
        let config = state.config.read().await;
        for step in &p.steps {
            if !config.agents.contains_key(&step.agent) {
                return Err(Error::AgentNotFound(step.agent.clone()));
            }
        }
        config.permissions.auto_approve
    };

    let steps: Vec<StepDef> = p
        .steps
        .into_iter()
        .map(|s| StepDef {
            name: s.name,
            agent: s.agent,
            prompt: s.prompt,
            model: s.model,
            depends_on: s.depends_on,
        })
        .collect();
    let def = WorkflowDefinition::new(&p.name, &p.project, steps);
    let snapshot = state.workflows.create(&def)?;
    state.workflow_defs.insert(def.id.clone(), def.clone());
    info!(workflow = %def.id, name = %def.name, "workflow created");

    let runner = Arc::new(BridgeStepRunner {
        state: state.clone(),
        project_dir,
        auto_approve,
    });
    let engine_state = state.clone();
    let engine_def = def.clone();
    tokio::spawn(async move {
        engine_state.workflows.execute(engine_def, runner).await;
    });

    Ok(json!({
        "workflow_id": def.id,
        "name": def.name,
        "status": snapshot.status,
        "steps": def.steps.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
    }))
}

async fn get_workflow_status(state: &SharedState, p: WorkflowIdParams) -> Result<Value> {
    let snapshot = state
        .workflows
        .get_state(&p.workflow_id)
        .ok_or_else(|| Error::WorkflowNotFound(p.workflow_id.clone()))?;
    Ok(serde_json::to_value(snapshot)?)
}

/// Runs each workflow step as a supervised task against its agent.
struct BridgeStepRunner {
    state: SharedState,
    project_dir: PathBuf,
    auto_approve: bool,
}

#[async_trait]
impl StepRunner for BridgeStepRunner {
    async fn run_step(
        &self,
        workflow: &WorkflowDefinition,
        step: &StepDef,
        prompt: String,
    ) -> StepOutcome {
        let (agent_cfg, model) = {
            let config = self.state.config.read().await;
            let Some(cfg) = config.agents.get(&step.agent) else {
                return StepOutcome::failed(
                    format!("agent '{}' is not configured", step.agent),
                    None,
                );
            };
            let model = match step.model.as_deref() {
                Some(m) if cfg.has_model(m) => m.to_string(),
                Some(m) => {
                    warn!(step = %step.name, model = m, "unknown step model, using default");
                    cfg.default_model.clone()
                }
                None => cfg.default_model.clone(),
            };
            (cfg.clone(), model)
        };

        let task = Task::new(&step.agent, &model, &workflow.project, &prompt, None);
        if let Err(e) = self.state.store.save(&task) {
            return StepOutcome::failed(format!("cannot persist step task: {}", e), None);
        }
        self.state.tasks.insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                pid: None,
            },
        );
        self.state.metrics.task_assigned(&step.agent);

        let spawn_config = build_spawn_config(&agent_cfg, &model, &self.project_dir);
        let result = run_task_session(&self.state, &task, spawn_config, self.auto_approve).await;
        let outcome = if let Some(error) = result.error.clone() {
            StepOutcome::failed(error, Some(task.id.clone()))
        } else {
            StepOutcome::ok(result.output.clone(), Some(task.id.clone()))
        };
        finalize_task(&self.state, &task.id, result);
        outcome
    }
}
