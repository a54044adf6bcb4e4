//! End-to-end assign_task tests against a fake `droid-acp` binary placed on
//! PATH. PATH mutation is process-global, so these tests serialize on a lock.

#![cfg(unix)]

use serde_json::json;
use std::sync::Mutex;
use teambridge_core::{BridgeConfig, TaskStatus};
use teambridge_server::handlers::dispatch;
use teambridge_server::tools::ToolCall;
use teambridge_server::{BridgeState, SharedState, TaskEntry};

static PATH_LOCK: Mutex<()> = Mutex::new(());

const FAKE_AGENT: &str = r#"#!/usr/bin/env bash
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1,"agentInfo":{"name":"droid","version":"1.0.0"}}}\n' "$id"
      ;;
    *'"newSession"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sess-1","models":[{"modelId":"gpt-5","name":"GPT-5"}]}}\n' "$id"
      ;;
    *'"setSessionModel"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'"prompt"'*)
      printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"sess-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"hi"}}}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn"}}\n' "$id"
      exit 0
      ;;
  esac
done
"#;

/// Install the fake agent on PATH and build a state rooted in a temp dir.
fn fixture() -> (tempfile::TempDir, SharedState) {
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    let agent_path = bin_dir.join("droid-acp");
    std::fs::write(&agent_path, FAKE_AGENT).unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&agent_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    let original_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var(
        "PATH",
        format!("{}:{}", bin_dir.to_string_lossy(), original_path),
    );

    std::fs::create_dir_all(dir.path().join("cli-team-bridge")).unwrap();

    let config: BridgeConfig = serde_json::from_value(json!({
        "workspaceRoot": dir.path().to_string_lossy(),
        "agents": {
            "droid": {
                "type": "acp",
                "command": "droid-acp",
                "defaultModel": "gpt-5",
                "models": { "gpt-5": {} }
            }
        },
        "permissions": { "autoApprove": true }
    }))
    .unwrap();
    let state = BridgeState::new(config).unwrap();
    (dir, state)
}

async fn call(
    state: &SharedState,
    name: &str,
    args: serde_json::Value,
) -> teambridge_core::Result<serde_json::Value> {
    let call = ToolCall::parse(name, &args)?;
    dispatch(state, call).await
}

#[tokio::test]
async fn happy_path_waits_for_completion() {
    let _guard = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, state) = fixture();

    let result = call(
        &state,
        "assign_task",
        json!({
            "agent": "droid",
            "prompt": "echo hi",
            "project": "cli-team-bridge",
            "wait": true,
            "timeout_seconds": 60
        }),
    )
    .await
    .unwrap();

    assert_eq!(result["status"], "completed");
    assert_eq!(result["agent"], "droid");
    assert_eq!(result["model"], "gpt-5");
    assert_eq!(result["output"], "hi");
    assert_eq!(result["error"], serde_json::Value::Null);
    assert!(result["duration_ms"].as_i64().unwrap() >= 0);

    // Durable row reflects the same terminal state
    let task_id = result["task_id"].as_str().unwrap();
    let stored = state.store.get(task_id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.output, "hi");
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn wait_false_returns_running_immediately() {
    let _guard = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, state) = fixture();

    let result = call(
        &state,
        "assign_task",
        json!({
            "agent": "droid",
            "prompt": "echo hi",
            "project": "cli-team-bridge"
        }),
    )
    .await
    .unwrap();
    assert_eq!(result["status"], "running");
    let task_id = result["task_id"].as_str().unwrap().to_string();

    // The background continuation finalizes the task
    for _ in 0..100 {
        if let Some(entry) = state.tasks.get(&task_id) {
            if entry.task.status.is_terminal() {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    let entry = state.tasks.get(&task_id).unwrap();
    assert_eq!(entry.task.status, TaskStatus::Completed);
    assert_eq!(entry.task.output, "hi");
}

#[tokio::test]
async fn global_admission_limit_enforced() {
    let _guard = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, state) = fixture();

    for i in 0..10 {
        let task = teambridge_core::Task::new("filler", "m", "p", format!("t{}", i), None);
        state.tasks.insert(
            task.id.clone(),
            TaskEntry { task, pid: None },
        );
    }

    let err = call(
        &state,
        "assign_task",
        json!({ "agent": "droid", "prompt": "x", "project": "cli-team-bridge" }),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("in flight"));
}

#[tokio::test]
async fn per_agent_admission_limit_enforced() {
    let _guard = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, state) = fixture();

    for i in 0..3 {
        let task = teambridge_core::Task::new("droid", "m", "p", format!("t{}", i), None);
        state.tasks.insert(
            task.id.clone(),
            TaskEntry { task, pid: None },
        );
    }

    let err = call(
        &state,
        "assign_task",
        json!({ "agent": "droid", "prompt": "x", "project": "cli-team-bridge" }),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("limit 3"));
}

#[tokio::test]
async fn unknown_model_falls_back_to_default() {
    let _guard = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, state) = fixture();

    let result = call(
        &state,
        "assign_task",
        json!({
            "agent": "droid",
            "prompt": "echo hi",
            "project": "cli-team-bridge",
            "model": "made-up-model",
            "wait": true,
            "timeout_seconds": 60
        }),
    )
    .await
    .unwrap();
    assert_eq!(result["model"], "gpt-5");
    assert_eq!(result["status"], "completed");
}

/// The project may be the workspace root itself.
#[tokio::test]
async fn project_dot_is_the_workspace_root() {
    let _guard = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, state) = fixture();

    let result = call(
        &state,
        "assign_task",
        json!({
            "agent": "droid",
            "prompt": "echo hi",
            "project": ".",
            "wait": true,
            "timeout_seconds": 60
        }),
    )
    .await
    .unwrap();
    assert_eq!(result["status"], "completed");
}

/// Spec boundary: a fake agent registered through messaging hooks appears in
/// the registry while the session runs, with context injected from unread
/// messages on the next run.
#[tokio::test]
async fn messaging_context_injection_round_trip() {
    let _guard = PATH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_dir, state) = fixture();

    // Queue a message for droid before it runs
    state.bus.ensure_inbox("droid").unwrap();
    state
        .bus
        .write_message("orchestrator", "droid", "remember the plan", Default::default())
        .unwrap();
    assert_eq!(state.bus.get_unread_count("droid"), 1);

    call(
        &state,
        "assign_task",
        json!({
            "agent": "droid",
            "prompt": "echo hi",
            "project": "cli-team-bridge",
            "wait": true,
            "timeout_seconds": 60
        }),
    )
    .await
    .unwrap();

    // The hook drained the inbox and registered the agent
    assert_eq!(state.bus.get_unread_count("droid"), 0);
    assert!(state.registry.get("droid").is_some());
}
