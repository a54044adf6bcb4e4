//! Rule evaluation — first match wins, default deny

use crate::rules::{builtin_rules, PathScope, PermissionAction, PermissionRule};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Argument keys recognized as carrying a file path.
const PATH_KEYS: &[&str] = &["file_path", "path", "filePath"];

/// Everything the engine needs to judge one tool call.
#[derive(Clone, Debug)]
pub struct PermissionContext {
    pub tool_name: String,
    pub tool_title: String,
    pub args: Map<String, Value>,
    pub project_root: PathBuf,
}

/// The verdict for one tool call.
#[derive(Clone, Debug)]
pub struct PermissionResult {
    pub action: PermissionAction,
    /// Name of the matched rule, if any.
    pub rule: Option<String>,
    pub reason: String,
}

impl PermissionResult {
    fn deny(rule: Option<&PermissionRule>, reason: impl Into<String>) -> Self {
        Self {
            action: PermissionAction::Deny,
            rule: rule.map(|r| r.name.clone()),
            reason: reason.into(),
        }
    }
}

/// Ordered rule list. Custom rules run before the builtins.
pub struct PolicyEngine {
    rules: Vec<PermissionRule>,
}

impl PolicyEngine {
    /// Engine with just the built-in rules.
    pub fn new(workspace_root: &Path, extra_read_dirs: &[PathBuf]) -> Self {
        Self {
            rules: builtin_rules(workspace_root, extra_read_dirs),
        }
    }

    /// Engine with `custom` rules prepended to the builtins.
    pub fn with_custom_rules(
        custom: Vec<PermissionRule>,
        workspace_root: &Path,
        extra_read_dirs: &[PathBuf],
    ) -> Self {
        let mut rules = custom;
        rules.extend(builtin_rules(workspace_root, extra_read_dirs));
        Self { rules }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate a tool call. Never raises: internal failures become deny.
    pub fn evaluate(&self, ctx: &PermissionContext) -> PermissionResult {
        for rule in &self.rules {
            // (a) tool-name match
            if !tool_matches(&rule.tool_pattern, &ctx.tool_name) {
                continue;
            }

            // (b) argument predicate
            if let Some(predicate) = &rule.predicate {
                if !predicate(&ctx.args) {
                    continue;
                }
            }

            // (c) path scope, when the arguments carry a path
            if let Some(scope) = &rule.path_scope {
                if let Some(raw_path) = extract_path(&ctx.args) {
                    match check_path(scope, raw_path, &ctx.project_root) {
                        PathVerdict::Ok => {}
                        PathVerdict::Blocked(reason) => {
                            let result = PermissionResult::deny(Some(rule), reason);
                            log_decision(ctx, &result);
                            return result;
                        }
                    }
                }
            }

            let reason = rule
                .log_message
                .clone()
                .unwrap_or_else(|| format!("matched rule '{}'", rule.name));
            let result = PermissionResult {
                action: rule.action,
                rule: Some(rule.name.clone()),
                reason,
            };
            log_decision(ctx, &result);
            return result;
        }

        let result = PermissionResult {
            action: PermissionAction::Deny,
            rule: None,
            reason: format!("no rule matched tool '{}'", ctx.tool_name),
        };
        log_decision(ctx, &result);
        result
    }
}

fn log_decision(ctx: &PermissionContext, result: &PermissionResult) {
    match result.action {
        PermissionAction::Deny => info!(
            tool = %ctx.tool_name,
            rule = result.rule.as_deref().unwrap_or("-"),
            "permission deny: {}",
            result.reason
        ),
        PermissionAction::Allow => debug!(
            tool = %ctx.tool_name,
            rule = result.rule.as_deref().unwrap_or("-"),
            "permission allow"
        ),
        PermissionAction::Ask => debug!(
            tool = %ctx.tool_name,
            rule = result.rule.as_deref().unwrap_or("-"),
            "permission ask"
        ),
    }
}

/// Literal equality, or `*`-wildcards interpreted as `.*` under a fully
/// anchored regex.
fn tool_matches(pattern: &str, tool_name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == tool_name;
    }
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    let regex_src = format!("^{}$", escaped.join(".*"));
    match Regex::new(&regex_src) {
        Ok(re) => re.is_match(tool_name),
        Err(e) => {
            warn!("invalid tool pattern '{}': {}", pattern, e);
            false
        }
    }
}

fn extract_path(args: &Map<String, Value>) -> Option<&str> {
    PATH_KEYS
        .iter()
        .find_map(|key| args.get(*key).and_then(Value::as_str))
}

enum PathVerdict {
    Ok,
    Blocked(String),
}

/// Lexically normalize `raw` against `project_root` (no filesystem access:
/// the target may not exist yet), then apply the scope.
fn check_path(scope: &PathScope, raw: &str, project_root: &Path) -> PathVerdict {
    let joined = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        project_root.join(raw)
    };

    let normalized = match normalize_lexically(&joined) {
        Some(p) => p,
        None => {
            return PathVerdict::Blocked(format!("cannot normalize path '{}'", raw));
        }
    };
    let normalized_str = normalized.to_string_lossy();

    for pattern in &scope.blocked_patterns {
        if pattern.is_match(&normalized_str) {
            return PathVerdict::Blocked(format!(
                "path '{}' matches blocked pattern '{}'",
                normalized_str, pattern
            ));
        }
    }

    if !scope.allowed_dirs.is_empty() {
        let inside = scope.allowed_dirs.iter().any(|dir| {
            normalize_lexically(dir)
                .map(|d| normalized.starts_with(&d))
                .unwrap_or(false)
        });
        if !inside {
            return PathVerdict::Blocked(format!(
                "path '{}' is outside the allowed directories",
                normalized_str
            ));
        }
    }

    PathVerdict::Ok
}

/// Resolve `.` and `..` components without touching the filesystem.
/// Returns None when `..` would climb above the root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(tool: &str, args: Value) -> PermissionContext {
        PermissionContext {
            tool_name: tool.into(),
            tool_title: tool.into(),
            args: args.as_object().cloned().unwrap_or_default(),
            project_root: PathBuf::from("/ws/project"),
        }
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Path::new("/ws"), &[])
    }

    #[test]
    fn wildcard_pattern_matching() {
        assert!(tool_matches("*", "Bash"));
        assert!(tool_matches("Bash", "Bash"));
        assert!(!tool_matches("Bash", "bash"));
        assert!(tool_matches("mcp__*", "mcp__files__read"));
        assert!(!tool_matches("mcp__*", "Bash"));
        assert!(tool_matches("*__read", "mcp__files__read"));
    }

    #[test]
    fn recursive_delete_denied() {
        let result = engine().evaluate(&ctx("Bash", json!({"command": "rm -rf /"})));
        assert_eq!(result.action, PermissionAction::Deny);
        assert_eq!(result.rule.as_deref(), Some("deny-recursive-delete"));
        assert!(result.reason.contains("Blocked recursive delete"));
    }

    #[test]
    fn plain_bash_asks() {
        let result = engine().evaluate(&ctx("Bash", json!({"command": "cargo build"})));
        assert_eq!(result.action, PermissionAction::Ask);
    }

    #[test]
    fn git_status_allowed_ahead_of_ask() {
        let result = engine().evaluate(&ctx("Bash", json!({"command": "git status"})));
        assert_eq!(result.action, PermissionAction::Allow);
        assert_eq!(result.rule.as_deref(), Some("allow-git-readonly"));
    }

    #[test]
    fn read_inside_workspace_allowed() {
        let result = engine().evaluate(&ctx("Read", json!({"file_path": "src/main.rs"})));
        assert_eq!(result.action, PermissionAction::Allow);
    }

    #[test]
    fn read_outside_workspace_denied() {
        let result = engine().evaluate(&ctx("Read", json!({"file_path": "/opt/other/file"})));
        assert_eq!(result.action, PermissionAction::Deny);
        assert!(result.reason.contains("outside"));
    }

    #[test]
    fn read_env_file_denied() {
        let result = engine().evaluate(&ctx("Read", json!({"file_path": ".env"})));
        assert_eq!(result.action, PermissionAction::Deny);
        assert!(result.reason.contains("blocked pattern"));
    }

    #[test]
    fn traversal_out_of_allowed_dirs_denied() {
        let result = engine().evaluate(&ctx(
            "Read",
            json!({"file_path": "../../../etc/passwd"}),
        ));
        assert_eq!(result.action, PermissionAction::Deny);
    }

    #[test]
    fn write_to_etc_denied_but_workspace_ok() {
        let denied = engine().evaluate(&ctx("Write", json!({"file_path": "/etc/hosts"})));
        assert_eq!(denied.action, PermissionAction::Deny);
        let allowed = engine().evaluate(&ctx("Write", json!({"file_path": "notes.md"})));
        assert_eq!(allowed.action, PermissionAction::Allow);
    }

    #[test]
    fn alternate_path_keys_recognized() {
        for key in ["file_path", "path", "filePath"] {
            let result = engine().evaluate(&ctx("Read", json!({ key: "/root/.ssh/id_rsa" })));
            assert_eq!(result.action, PermissionAction::Deny, "key {}", key);
        }
    }

    #[test]
    fn unknown_tool_default_denied() {
        let result = engine().evaluate(&ctx("LaunchMissiles", json!({})));
        assert_eq!(result.action, PermissionAction::Deny);
        assert!(result.rule.is_none());
    }

    #[test]
    fn custom_rules_run_first() {
        let custom = vec![PermissionRule::new(
            "allow-anything",
            "*",
            PermissionAction::Allow,
        )];
        let engine = PolicyEngine::with_custom_rules(custom, Path::new("/ws"), &[]);
        let result = engine.evaluate(&ctx("Bash", json!({"command": "rm -rf /"})));
        assert_eq!(result.action, PermissionAction::Allow);
        assert_eq!(result.rule.as_deref(), Some("allow-anything"));
    }

    #[test]
    fn drop_table_denied_regardless_of_tool() {
        let result = engine().evaluate(&ctx(
            "Bash",
            json!({"command": "sqlite3 db.sqlite 'DROP TABLE users'"}),
        ));
        assert_eq!(result.action, PermissionAction::Deny);
        assert_eq!(result.rule.as_deref(), Some("deny-drop-table"));
    }
}
