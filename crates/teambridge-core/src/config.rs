//! Bridge config — serde structs for bridge.config.json
//!
//! Pure types and parsing only. Loading happens at startup and on SIGHUP;
//! the binary deep-replaces the shared copy under an RwLock.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Agent commands accepted at config load time.
pub const ALLOWED_AGENT_COMMANDS: &[&str] = &["codex-acp", "claude-code-acp", "droid-acp"];

/// Additional commands declared by the build. Empty by default.
pub const EXTRA_AGENT_COMMANDS: &[&str] = &[];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub workspace_root: String,
    pub agents: HashMap<String, AgentConfig>,
    pub permissions: PermissionsConfig,
    pub polling: PollingConfig,
    pub logging: LoggingConfig,
    pub messaging: MessagingConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(rename = "type")]
    pub agent_type: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub default_model: String,
    pub models: HashMap<String, ModelConfig>,
    pub strengths: Vec<String>,
    pub env: Option<HashMap<String, String>>,
    pub fallback_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfig {
    pub flag: Option<String>,
    pub value: Option<String>,
    pub key_env: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PermissionsConfig {
    pub auto_approve: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollingConfig {
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 2000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessagingConfig {
    pub enabled: bool,
    pub fail_silently: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_silently: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewerConfig {
    pub enabled: bool,
    pub mode: Option<String>,
    pub interactive: bool,
}

impl BridgeConfig {
    /// Load and validate from a path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject unknown agent commands and empty workspace roots.
    pub fn validate(&self) -> Result<()> {
        if self.workspace_root.is_empty() {
            return Err(Error::Config("workspaceRoot is required".into()));
        }
        for (name, agent) in &self.agents {
            let allowed = ALLOWED_AGENT_COMMANDS.contains(&agent.command.as_str())
                || EXTRA_AGENT_COMMANDS.contains(&agent.command.as_str());
            if !allowed {
                return Err(Error::Config(format!(
                    "agent '{}' uses unknown command '{}'",
                    name, agent.command
                )));
            }
        }
        Ok(())
    }

    pub fn workspace_root(&self) -> PathBuf {
        PathBuf::from(&self.workspace_root)
    }

    /// Root for persisted bus/registry state.
    pub fn bridge_root(&self) -> PathBuf {
        self.workspace_root().join(".claude").join("bridge")
    }

    /// Path of the embedded task store.
    pub fn task_store_path(&self) -> PathBuf {
        self.workspace_root().join(".bridge-tasks.db")
    }
}

impl AgentConfig {
    /// Whether `requested` names a configured model (by key).
    pub fn has_model(&self, requested: &str) -> bool {
        self.models.contains_key(requested)
    }

    /// API-key env var names for every configured model.
    pub fn key_env_vars(&self) -> Vec<&str> {
        self.models
            .values()
            .filter_map(|m| m.key_env.as_deref())
            .collect()
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    #[test]
    fn load_minimal_config() {
        let f = write_config(
            r#"{
                "workspaceRoot": "/tmp/ws",
                "agents": {
                    "droid": {
                        "type": "acp",
                        "command": "droid-acp",
                        "defaultModel": "gpt-5",
                        "models": { "gpt-5": { "keyEnv": "FACTORY_API_KEY" } }
                    }
                }
            }"#,
        );
        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.workspace_root, "/tmp/ws");
        let droid = &config.agents["droid"];
        assert_eq!(droid.command, "droid-acp");
        assert!(droid.has_model("gpt-5"));
        assert_eq!(droid.key_env_vars(), vec!["FACTORY_API_KEY"]);
        assert_eq!(
            config.task_store_path(),
            PathBuf::from("/tmp/ws/.bridge-tasks.db")
        );
        assert_eq!(
            config.bridge_root(),
            PathBuf::from("/tmp/ws/.claude/bridge")
        );
    }

    #[test]
    fn unknown_command_rejected() {
        let f = write_config(
            r#"{
                "workspaceRoot": "/tmp/ws",
                "agents": {
                    "evil": { "type": "acp", "command": "curl", "defaultModel": "m" }
                }
            }"#,
        );
        let err = BridgeConfig::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn missing_workspace_root_rejected() {
        let f = write_config(r#"{ "agents": {} }"#);
        assert!(BridgeConfig::load(f.path()).is_err());
    }

    #[test]
    fn defaults_applied() {
        let f = write_config(r#"{ "workspaceRoot": "/tmp/ws" }"#);
        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.messaging.enabled);
        assert_eq!(config.polling.interval_ms, 2000);
    }
}
