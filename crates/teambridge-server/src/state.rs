//! Shared handler context
//!
//! One `BridgeState` per process, injected into every handler. Task-table
//! mutations go through the `DashMap` entry locks; bus and registry files
//! serialize internally.

use crate::metrics::Metrics;
use crate::workflow::WorkflowEngine;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teambridge_bus::{AgentRegistry, MessageBus};
use teambridge_core::{BridgeConfig, OpsCounters, Result, Task, WorkflowDefinition};
use teambridge_policy::PolicyEngine;
use teambridge_store::TaskStore;
use tokio::sync::RwLock;

/// Global in-flight task ceiling.
pub const MAX_GLOBAL_RUNNING: usize = 10;
/// Per-agent in-flight task ceiling.
pub const MAX_PER_AGENT_RUNNING: usize = 3;
/// In-memory task table cap; pruning kicks in above this.
pub const TASK_TABLE_CAP: usize = 100;
/// Terminal tasks younger than this are never pruned.
pub const PRUNE_GRACE_MS: i64 = 5 * 60 * 1000;
/// Terminal tasks older than this are dropped when above the cap.
pub const RETENTION_MS: i64 = 60 * 60 * 1000;
/// Default synchronous wait for `assign_task`.
pub const DEFAULT_WAIT_SECS: u64 = 300;
/// Hard ceiling on the synchronous wait.
pub const MAX_WAIT_SECS: u64 = 1800;

/// One row of the in-memory task table: the task plus its live process pid.
#[derive(Clone, Debug)]
pub struct TaskEntry {
    pub task: Task,
    pub pid: Option<u32>,
}

pub struct BridgeState {
    pub config: RwLock<BridgeConfig>,
    pub workspace_root: PathBuf,
    pub store: TaskStore,
    pub bus: MessageBus,
    pub registry: Arc<AgentRegistry>,
    pub workflows: WorkflowEngine,
    pub tasks: DashMap<String, TaskEntry>,
    pub workflow_defs: DashMap<String, WorkflowDefinition>,
    pub metrics: Metrics,
    pub policy: Arc<PolicyEngine>,
}

pub type SharedState = Arc<BridgeState>;

impl BridgeState {
    /// Wire up every subsystem from a validated config.
    pub fn new(config: BridgeConfig) -> Result<SharedState> {
        let counters = OpsCounters::new();
        let workspace_root = config.workspace_root();
        let store = TaskStore::open(&config.task_store_path())?;
        let bus = MessageBus::new(config.bridge_root(), counters.clone())?;
        let registry = Arc::new(AgentRegistry::open(
            config.bridge_root().join("agents.json"),
            counters.clone(),
        ));
        let policy = Arc::new(PolicyEngine::new(&workspace_root, &[]));

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            workspace_root,
            store,
            bus,
            registry,
            workflows: WorkflowEngine::new(),
            tasks: DashMap::new(),
            workflow_defs: DashMap::new(),
            metrics: Metrics::new(counters),
            policy,
        }))
    }

    /// Replace the config wholesale (SIGHUP reload).
    pub async fn replace_config(&self, config: BridgeConfig) {
        let mut guard = self.config.write().await;
        *guard = config;
    }

    pub fn running_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|e| !e.task.status.is_terminal())
            .count()
    }

    pub fn running_task_count_for(&self, agent: &str) -> usize {
        self.tasks
            .iter()
            .filter(|e| !e.task.status.is_terminal() && e.task.agent == agent)
            .count()
    }

    /// Resolve `project` against the workspace root, rejecting traversal.
    pub fn resolve_project(&self, project: &str) -> Result<PathBuf> {
        let joined = self.workspace_root.join(project);
        let normalized = normalize_lexically(&joined).ok_or_else(|| {
            teambridge_core::Error::Validation(format!(
                "project '{}' escapes workspace root",
                project
            ))
        })?;
        let root = normalize_lexically(&self.workspace_root).unwrap_or_default();
        if normalized != root && !normalized.starts_with(&root) {
            return Err(teambridge_core::Error::Validation(format!(
                "project '{}' escapes workspace root",
                project
            )));
        }
        Ok(normalized)
    }
}

/// Resolve `.` and `..` without filesystem access; None when `..` climbs
/// above the root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Test fixture: a state rooted in a temp dir with one configured agent.
#[cfg(test)]
pub(crate) fn test_state() -> (tempfile::TempDir, SharedState) {
    let dir = tempfile::tempdir().unwrap();
    let config: BridgeConfig = serde_json::from_value(serde_json::json!({
        "workspaceRoot": dir.path().to_string_lossy(),
        "agents": {
            "droid": {
                "type": "acp",
                "command": "droid-acp",
                "defaultModel": "gpt-5",
                "models": { "gpt-5": { "keyEnv": "FACTORY_API_KEY" } }
            }
        }
    }))
    .unwrap();
    let state = BridgeState::new(config).unwrap();
    (dir, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use teambridge_core::TaskStatus;

    #[test]
    fn project_resolution_rejects_traversal() {
        let (dir, state) = test_state();
        std::fs::create_dir_all(dir.path().join("proj")).unwrap();

        let ok = state.resolve_project("proj").unwrap();
        assert!(ok.starts_with(dir.path()));

        // The root itself is allowed
        assert!(state.resolve_project(".").is_ok());

        let err = state.resolve_project("../../etc").unwrap_err();
        assert!(err.to_string().contains("escapes workspace root"));
    }

    #[test]
    fn running_counts_ignore_terminal_tasks() {
        let (_dir, state) = test_state();
        let mut t1 = Task::new("droid", "m", "p", "x", None);
        let t2 = Task::new("droid", "m", "p", "y", None);
        let t3 = Task::new("other", "m", "p", "z", None);
        t1.status = TaskStatus::Completed;
        for t in [&t1, &t2, &t3] {
            state.tasks.insert(
                t.id.clone(),
                TaskEntry {
                    task: t.clone(),
                    pid: None,
                },
            );
        }
        assert_eq!(state.running_task_count(), 2);
        assert_eq!(state.running_task_count_for("droid"), 1);
    }
}
