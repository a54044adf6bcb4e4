//! Workflow engine tests: validation, the diamond, and failure cascades.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use teambridge_core::{StepDef, StepStatus, WorkflowDefinition, WorkflowStatus};
use teambridge_server::{StepOutcome, StepRunner, WorkflowEngine};

fn step(name: &str, deps: &[&str]) -> StepDef {
    StepDef {
        name: name.into(),
        agent: "droid".into(),
        prompt: format!("run {}", name),
        model: None,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
    }
}

fn workflow(steps: Vec<StepDef>) -> WorkflowDefinition {
    WorkflowDefinition::new("test-flow", "proj", steps)
}

/// Runner that completes immediately, recording the prompts it saw.
struct RecordingRunner {
    prompts: Mutex<HashMap<String, String>>,
    fail: Vec<String>,
}

impl RecordingRunner {
    fn new(fail: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            prompts: Mutex::new(HashMap::new()),
            fail: fail.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl StepRunner for RecordingRunner {
    async fn run_step(
        &self,
        _workflow: &WorkflowDefinition,
        step: &StepDef,
        prompt: String,
    ) -> StepOutcome {
        self.prompts
            .lock()
            .unwrap()
            .insert(step.name.clone(), prompt);
        if self.fail.contains(&step.name) {
            StepOutcome::failed(format!("{} blew up", step.name), None)
        } else {
            StepOutcome::ok(format!("output of {}", step.name), None)
        }
    }
}

// ===========================================================================
// Validation
// ===========================================================================

#[test]
fn unknown_dependency_rejected() {
    let def = workflow(vec![step("a", &["ghost"])]);
    let err = WorkflowEngine::validate(&def).unwrap_err();
    assert!(err.to_string().contains("unknown step 'ghost'"));
}

#[test]
fn duplicate_step_name_rejected() {
    let def = workflow(vec![step("a", &[]), step("a", &[])]);
    let err = WorkflowEngine::validate(&def).unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn cycle_rejected() {
    let def = workflow(vec![step("a", &["b"]), step("b", &["a"])]);
    let err = WorkflowEngine::validate(&def).unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn self_cycle_rejected() {
    let def = workflow(vec![step("a", &["a"])]);
    assert!(WorkflowEngine::validate(&def).is_err());
}

#[test]
fn empty_workflow_rejected() {
    let def = workflow(vec![]);
    assert!(WorkflowEngine::validate(&def).is_err());
}

#[test]
fn valid_dag_accepted() {
    let def = workflow(vec![
        step("init", &[]),
        step("b1", &["init"]),
        step("b2", &["init"]),
        step("merge", &["b1", "b2"]),
    ]);
    assert!(WorkflowEngine::validate(&def).is_ok());
}

// ===========================================================================
// Execution
// ===========================================================================

#[tokio::test]
async fn diamond_completes_with_ordering() {
    let engine = WorkflowEngine::new();
    let def = workflow(vec![
        step("init", &[]),
        step("b1", &["init"]),
        step("b2", &["init"]),
        step("merge", &["b1", "b2"]),
    ]);
    let runner = RecordingRunner::new(&[]);
    engine.create(&def).unwrap();
    engine.execute(def.clone(), runner.clone()).await;

    let state = engine.get_state(&def.id).unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    for name in ["init", "b1", "b2", "merge"] {
        assert_eq!(state.steps[name].status, StepStatus::Completed, "{}", name);
    }

    // merge starts only after both branches finished
    let merge_started = state.steps["merge"].started_at.unwrap();
    let b1_done = state.steps["b1"].completed_at.unwrap();
    let b2_done = state.steps["b2"].completed_at.unwrap();
    assert!(merge_started >= b1_done.max(b2_done));

    // merge's prompt carries both branch outputs framed
    let prompts = runner.prompts.lock().unwrap();
    let merge_prompt = &prompts["merge"];
    assert!(merge_prompt.contains("--- Output from \"b1\" ---"));
    assert!(merge_prompt.contains("output of b1"));
    assert!(merge_prompt.contains("--- Output from \"b2\" ---"));
    assert!(merge_prompt.contains("--- End ---"));
    assert!(merge_prompt.ends_with("run merge"));

    // a root step's prompt is untouched
    assert_eq!(prompts["init"], "run init");
}

#[tokio::test]
async fn failure_cascades_to_dependents() {
    let engine = WorkflowEngine::new();
    let def = workflow(vec![
        step("init", &[]),
        step("broken", &["init"]),
        step("downstream", &["broken"]),
        step("independent", &["init"]),
    ]);
    let runner = RecordingRunner::new(&["broken"]);
    engine.create(&def).unwrap();
    engine.execute(def.clone(), runner.clone()).await;

    let state = engine.get_state(&def.id).unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.steps["init"].status, StepStatus::Completed);
    assert_eq!(state.steps["broken"].status, StepStatus::Failed);
    assert!(state.steps["broken"]
        .error
        .as_deref()
        .unwrap()
        .contains("blew up"));
    assert_eq!(state.steps["downstream"].status, StepStatus::Skipped);
    // unrelated branch still ran
    assert_eq!(state.steps["independent"].status, StepStatus::Completed);

    // skipped steps never reach the runner
    assert!(!runner.prompts.lock().unwrap().contains_key("downstream"));
}

#[tokio::test]
async fn skip_cascades_transitively() {
    let engine = WorkflowEngine::new();
    let def = workflow(vec![
        step("a", &[]),
        step("b", &["a"]),
        step("c", &["b"]),
        step("d", &["c"]),
    ]);
    let runner = RecordingRunner::new(&["a"]);
    engine.create(&def).unwrap();
    engine.execute(def.clone(), runner).await;

    let state = engine.get_state(&def.id).unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.steps["a"].status, StepStatus::Failed);
    for name in ["b", "c", "d"] {
        assert_eq!(state.steps[name].status, StepStatus::Skipped, "{}", name);
    }
}

#[tokio::test]
async fn single_step_workflow() {
    let engine = WorkflowEngine::new();
    let def = workflow(vec![step("only", &[])]);
    engine.create(&def).unwrap();
    engine.execute(def.clone(), RecordingRunner::new(&[])).await;

    let state = engine.get_state(&def.id).unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.steps["only"].output, "output of only");
}

#[test]
fn unknown_workflow_has_no_state() {
    let engine = WorkflowEngine::new();
    assert!(engine.get_state("missing").is_none());
}
