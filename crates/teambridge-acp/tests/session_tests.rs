//! End-to-end supervisor tests against a scripted fake agent.
//!
//! The fake agent is a small bash script speaking line-delimited JSON-RPC on
//! stdio: it answers the handshake, streams one message chunk, and returns a
//! stop reason.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use teambridge_acp::{run_session, SessionOptions};
use teambridge_core::SpawnConfig;
use teambridge_policy::PolicyEngine;

const FAKE_AGENT: &str = r#"#!/usr/bin/env bash
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1,"agentInfo":{"name":"fake-agent","version":"0.0.1"}}}\n' "$id"
      ;;
    *'"newSession"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sess-1","models":[{"modelId":"fake-model","name":"Fake Model"}]}}\n' "$id"
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

fn write_script(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("fake-agent.sh");
    std::fs::write(&path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn spawn_config(dir: &Path, script: &Path) -> SpawnConfig {
    let mut env = HashMap::new();
    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }
    SpawnConfig {
        command: "bash".to_string(),
        args: vec![script.to_string_lossy().to_string()],
        cwd: dir.to_path_buf(),
        env,
    }
}

fn session_options(dir: &Path, prompt: &str) -> SessionOptions {
    SessionOptions {
        agent_name: "fake".into(),
        model: Some("fake-model".into()),
        prompt: prompt.into(),
        project_root: dir.to_path_buf(),
        policy: Arc::new(PolicyEngine::new(dir, &[])),
        auto_approve: true,
        hooks: None,
        session_timeout: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn happy_path_returns_streamed_output() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), FAKE_AGENT);
    let result = run_session(
        spawn_config(dir.path(), &script),
        session_options(dir.path(), "say hi"),
    )
    .await;

    assert_eq!(result.error, None);
    assert_eq!(result.output, "hi");
    assert_eq!(result.stop_reason.as_deref(), Some("end_turn"));
    assert!(!result.timed_out);
}

#[tokio::test]
async fn immediate_exit_is_a_structured_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "#!/usr/bin/env bash\necho oops >&2\nexit 7\n");
    let result = run_session(
        spawn_config(dir.path(), &script),
        session_options(dir.path(), "anything"),
    )
    .await;

    let error = result.error.expect("session must fail");
    assert!(error.contains("exited"), "unexpected error: {}", error);
    assert!(error.contains("oops"), "stderr tail missing: {}", error);
}

#[tokio::test]
async fn missing_binary_is_a_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = SpawnConfig {
        command: "teambridge-no-such-agent-binary".to_string(),
        args: vec![],
        cwd: dir.path().to_path_buf(),
        env: HashMap::new(),
    };
    let result = run_session(config, session_options(dir.path(), "x")).await;
    let error = result.error.expect("spawn must fail");
    assert!(error.contains("spawn failed"), "unexpected error: {}", error);
}

/// Agent that asks permission to run `rm -rf /` before answering, and
/// reports which option the bridge picked.
const PERMISSION_AGENT: &str = r#"#!/usr/bin/env bash
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1}}\n' "$id"
      ;;
    *'"newSession"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sess-1","models":[]}}\n' "$id"
      ;;
    *'"prompt"'*)
      printf '{"jsonrpc":"2.0","id":99,"method":"session/request_permission","params":{"sessionId":"sess-1","toolCall":{"toolCallId":"tc1","name":"Bash","title":"Bash","rawInput":{"command":"rm -rf /"}},"options":[{"optionId":"opt-allow","name":"Allow","kind":"allow_once"},{"optionId":"opt-deny","name":"Deny","kind":"deny"}]}}\n'
      IFS= read -r verdict_line
      case "$verdict_line" in
        *opt-deny*) verdict="denied" ;;
        *) verdict="allowed" ;;
      esac
      printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"sess-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"%s"}}}}\n' "$verdict"
      printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn"}}\n' "$id"
      exit 0
      ;;
  esac
done
"#;

#[tokio::test]
async fn destructive_permission_request_denied_live() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), PERMISSION_AGENT);
    let result = run_session(
        spawn_config(dir.path(), &script),
        session_options(dir.path(), "clean up"),
    )
    .await;

    assert_eq!(result.error, None);
    // The agent echoes which option the bridge selected
    assert_eq!(result.output, "denied");
}

#[tokio::test]
async fn hung_agent_times_out() {
    let dir = tempfile::tempdir().unwrap();
    // Answers nothing; just keeps the pipe open
    let script = write_script(dir.path(), "#!/usr/bin/env bash\nexec sleep 600\n");
    let mut opts = session_options(dir.path(), "x");
    opts.session_timeout = Duration::from_millis(500);
    let result = run_session(spawn_config(dir.path(), &script), opts).await;

    assert!(result.timed_out);
    assert!(result.error.unwrap().contains("timed out"));
}
