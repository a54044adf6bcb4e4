//! Workflow engine — DAG validation and parallel step execution
//!
//! Steps run as soon as every dependency has completed; a failed or skipped
//! dependency cascades `skipped` through its dependents. The workflow is
//! `failed` iff any step finished `failed` or `skipped`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use teambridge_core::{
    Error, Result, StepDef, StepResult, StepStatus, WorkflowDefinition, WorkflowState,
    WorkflowStatus,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Outcome of running one step. `error = Some` marks the step failed.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub output: String,
    pub error: Option<String>,
    pub task_id: Option<String>,
}

impl StepOutcome {
    pub fn ok(output: impl Into<String>, task_id: Option<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
            task_id,
        }
    }

    pub fn failed(error: impl Into<String>, task_id: Option<String>) -> Self {
        Self {
            output: String::new(),
            error: Some(error.into()),
            task_id,
        }
    }
}

/// Executes one step; the server's implementation drives a supervisor
/// session against the step's agent.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(
        &self,
        workflow: &WorkflowDefinition,
        step: &StepDef,
        prompt: String,
    ) -> StepOutcome;
}

#[derive(Default)]
pub struct WorkflowEngine {
    states: DashMap<String, Arc<Mutex<WorkflowState>>>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject unknown dependencies, duplicate step names, and cycles.
    pub fn validate(def: &WorkflowDefinition) -> Result<()> {
        if def.steps.is_empty() {
            return Err(Error::Workflow("workflow has no steps".into()));
        }

        let mut names = HashSet::new();
        for step in &def.steps {
            if !names.insert(step.name.as_str()) {
                return Err(Error::Workflow(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }
        for step in &def.steps {
            for dep in &step.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(Error::Workflow(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name, dep
                    )));
                }
            }
        }

        // Depth-first search with a recursion stack
        let by_name: HashMap<&str, &StepDef> =
            def.steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        for step in &def.steps {
            visit(step.name.as_str(), &by_name, &mut visited, &mut stack)?;
        }
        Ok(())
    }

    /// Register a workflow and return its initial (pending) snapshot.
    pub fn create(&self, def: &WorkflowDefinition) -> Result<WorkflowState> {
        Self::validate(def)?;
        let state = WorkflowState {
            id: def.id.clone(),
            name: def.name.clone(),
            status: WorkflowStatus::Pending,
            created_at: def.created_at,
            steps: def
                .steps
                .iter()
                .map(|s| (s.name.clone(), StepResult::default()))
                .collect(),
        };
        self.states
            .insert(def.id.clone(), Arc::new(Mutex::new(state.clone())));
        Ok(state)
    }

    pub fn get_state(&self, id: &str) -> Option<WorkflowState> {
        self.states
            .get(id)
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    /// Run the DAG to completion. The workflow must have been `create`d.
    pub async fn execute(&self, def: WorkflowDefinition, runner: Arc<dyn StepRunner>) {
        let Some(shared) = self.states.get(&def.id).map(|s| Arc::clone(s.value())) else {
            error!(workflow = %def.id, "execute called for unregistered workflow");
            return;
        };
        set_status(&shared, WorkflowStatus::Running);
        info!(workflow = %def.id, name = %def.name, steps = def.steps.len(), "workflow started");

        let def = Arc::new(def);
        let mut completed: HashMap<String, String> = HashMap::new();
        let mut failed_or_skipped: HashSet<String> = HashSet::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut running: JoinSet<(String, StepOutcome)> = JoinSet::new();

        loop {
            let runnable: Vec<&StepDef> = def
                .steps
                .iter()
                .filter(|s| !started.contains(&s.name))
                .filter(|s| s.depends_on.iter().all(|d| completed.contains_key(d)))
                .collect();

            if runnable.is_empty() && running.is_empty() {
                // Cascade skips to steps downstream of failures, then stop
                let to_skip: Vec<String> = def
                    .steps
                    .iter()
                    .filter(|s| !started.contains(&s.name))
                    .filter(|s| s.depends_on.iter().any(|d| failed_or_skipped.contains(d)))
                    .map(|s| s.name.clone())
                    .collect();
                if to_skip.is_empty() {
                    break;
                }
                for name in to_skip {
                    warn!(workflow = %def.id, step = %name, "step skipped (failed dependency)");
                    mark_skipped(&shared, &name);
                    failed_or_skipped.insert(name.clone());
                    started.insert(name);
                }
                continue;
            }

            for step in runnable {
                started.insert(step.name.clone());
                mark_running(&shared, &step.name);
                let prompt = build_step_prompt(step, &completed);
                let runner = runner.clone();
                let def = def.clone();
                let step = step.clone();
                running.spawn(async move {
                    let outcome = runner.run_step(&def, &step, prompt).await;
                    (step.name.clone(), outcome)
                });
            }

            match running.join_next().await {
                Some(Ok((name, outcome))) => {
                    if let Some(error) = &outcome.error {
                        warn!(workflow = %def.id, step = %name, "step failed: {}", error);
                        failed_or_skipped.insert(name.clone());
                    } else {
                        debug!(workflow = %def.id, step = %name, "step completed");
                        completed.insert(name.clone(), outcome.output.clone());
                    }
                    finalize_step(&shared, &name, outcome);
                }
                Some(Err(join_error)) => {
                    error!(workflow = %def.id, "step task panicked: {}", join_error);
                    // The step stays `running` in the snapshot only if we
                    // cannot identify it; mark the whole workflow failed below.
                    break;
                }
                None => {}
            }
        }

        let final_status = {
            let state = shared.lock().unwrap_or_else(|e| e.into_inner());
            let any_bad = state
                .steps
                .values()
                .any(|s| s.status != StepStatus::Completed);
            if any_bad {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            }
        };
        set_status(&shared, final_status);
        info!(workflow = %def.id, status = ?final_status, "workflow finished");
    }
}

fn visit(
    name: &str,
    by_name: &HashMap<&str, &StepDef>,
    visited: &mut HashSet<String>,
    stack: &mut HashSet<String>,
) -> Result<()> {
    if stack.contains(name) {
        return Err(Error::Workflow(format!(
            "dependency cycle involving step '{}'",
            name
        )));
    }
    if visited.contains(name) {
        return Ok(());
    }
    stack.insert(name.to_string());
    if let Some(step) = by_name.get(name) {
        for dep in &step.depends_on {
            visit(dep, by_name, visited, stack)?;
        }
    }
    stack.remove(name);
    visited.insert(name.to_string());
    Ok(())
}

/// Frame each dependency's output ahead of the step's own prompt.
fn build_step_prompt(step: &StepDef, completed: &HashMap<String, String>) -> String {
    let mut sections: Vec<String> = Vec::new();
    for dep in &step.depends_on {
        if let Some(output) = completed.get(dep) {
            sections.push(format!(
                "--- Output from \"{}\" ---\n{}\n--- End ---",
                dep, output
            ));
        }
    }
    if sections.is_empty() {
        step.prompt.clone()
    } else {
        format!("{}\n\n{}", sections.join("\n\n"), step.prompt)
    }
}

fn set_status(shared: &Arc<Mutex<WorkflowState>>, status: WorkflowStatus) {
    let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
    state.status = status;
}

fn mark_running(shared: &Arc<Mutex<WorkflowState>>, name: &str) {
    let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(step) = state.steps.get_mut(name) {
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
    }
}

fn mark_skipped(shared: &Arc<Mutex<WorkflowState>>, name: &str) {
    let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(step) = state.steps.get_mut(name) {
        step.status = StepStatus::Skipped;
        step.completed_at = Some(Utc::now());
    }
}

fn finalize_step(shared: &Arc<Mutex<WorkflowState>>, name: &str, outcome: StepOutcome) {
    let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(step) = state.steps.get_mut(name) {
        step.status = if outcome.error.is_some() {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        step.completed_at = Some(Utc::now());
        step.output = outcome.output;
        step.error = outcome.error;
        step.task_id = outcome.task_id;
    }
}
