//! Agent process spawning with a strict environment allowlist
//!
//! Only the allowlisted variables plus each agent's configured API-key
//! variables are forwarded; the child never inherits the bridge's full
//! environment.

use std::collections::HashMap;
use teambridge_core::SpawnConfig;
use tokio::process::{Child, Command};
use tracing::debug;

/// Base variables forwarded to every spawned agent.
pub const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "SHELL", "TERM", "LANG"];

/// Build the child environment: the allowlist plus `extra_keys`, taken from
/// the bridge's own environment. Missing variables are simply absent.
pub fn build_env(extra_keys: &[String]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    for key in extra_keys {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.clone(), value);
        }
    }
    env
}

/// Spawn the agent with piped stdio and no inherited environment.
pub fn spawn_agent(config: &SpawnConfig) -> std::io::Result<Child> {
    debug!(
        command = %config.command,
        cwd = %config.cwd.display(),
        "spawning agent process"
    );
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.cwd)
        .env_clear()
        .envs(&config.env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    // New process group for clean killability (Unix)
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_env_filters_to_allowlist() {
        std::env::set_var("TEAMBRIDGE_TEST_SECRET", "sensitive");
        std::env::set_var("TEAMBRIDGE_TEST_KEY", "k");
        let env = build_env(&["TEAMBRIDGE_TEST_KEY".to_string()]);
        assert!(!env.contains_key("TEAMBRIDGE_TEST_SECRET"));
        assert_eq!(env.get("TEAMBRIDGE_TEST_KEY").map(String::as_str), Some("k"));
        // PATH is present on any sane system
        assert!(env.contains_key("PATH"));
        std::env::remove_var("TEAMBRIDGE_TEST_SECRET");
        std::env::remove_var("TEAMBRIDGE_TEST_KEY");
    }

    #[test]
    fn missing_extra_keys_are_absent() {
        let env = build_env(&["DEFINITELY_NOT_SET_ANYWHERE_12345".to_string()]);
        assert!(!env.contains_key("DEFINITELY_NOT_SET_ANYWHERE_12345"));
    }
}
