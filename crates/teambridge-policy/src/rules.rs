//! Permission rule definitions and the built-in rule set

use crate::shell;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What to do with a matching tool call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

impl std::fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

/// Argument predicate — stage (b) of rule matching.
pub type ArgPredicate = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// Path restrictions — stage (c) of rule matching.
#[derive(Clone, Debug, Default)]
pub struct PathScope {
    /// When non-empty, a recognized path must live under one of these.
    pub allowed_dirs: Vec<PathBuf>,
    /// A path matching any of these is denied outright.
    pub blocked_patterns: Vec<Regex>,
}

/// One declarative rule. Rules are evaluated in order, first match wins.
#[derive(Clone)]
pub struct PermissionRule {
    pub name: String,
    /// Exact tool name or `*`-wildcard pattern.
    pub tool_pattern: String,
    pub action: PermissionAction,
    pub path_scope: Option<PathScope>,
    pub predicate: Option<ArgPredicate>,
    pub log_message: Option<String>,
}

impl std::fmt::Debug for PermissionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionRule")
            .field("name", &self.name)
            .field("tool_pattern", &self.tool_pattern)
            .field("action", &self.action)
            .field("has_predicate", &self.predicate.is_some())
            .field("has_path_scope", &self.path_scope.is_some())
            .finish()
    }
}

impl PermissionRule {
    pub fn new(
        name: impl Into<String>,
        tool_pattern: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        Self {
            name: name.into(),
            tool_pattern: tool_pattern.into(),
            action,
            path_scope: None,
            predicate: None,
            log_message: None,
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_path_scope(mut self, scope: PathScope) -> Self {
        self.path_scope = Some(scope);
        self
    }

    pub fn with_log(mut self, message: impl Into<String>) -> Self {
        self.log_message = Some(message.into());
        self
    }
}

/// Paths that look like credentials. Blocked for read and write alike.
pub const SECRET_PATH_PATTERNS: &[&str] = &[
    r"\.env$",
    r"\.ssh/",
    r"\.aws/",
    r"\.docker/",
    r"id_rsa",
    r"id_ed25519",
    r"\.pem$",
    r"\.key$",
    r"(?i)secrets?\.",
    r"(?i)password",
    r"(?i)token",
];

/// System locations the agent must never write.
pub const SYSTEM_PATH_PATTERNS: &[&str] = &[r"^/etc/", r"^/usr/bin/", r"^/bin/"];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("builtin path pattern is valid"))
        .collect()
}

/// Predicate over the `command` argument of shell tools.
fn command_is(check: fn(&str) -> bool) -> impl Fn(&Map<String, Value>) -> bool {
    move |args| {
        args.get("command")
            .and_then(Value::as_str)
            .map(check)
            .unwrap_or(false)
    }
}

/// Predicate over the full serialized argument map.
fn args_text_has(check: fn(&str) -> bool) -> impl Fn(&Map<String, Value>) -> bool {
    move |args| {
        let text = serde_json::to_string(args).unwrap_or_default();
        check(&text)
    }
}

/// The built-in rule set from most-destructive down to the ask fallbacks.
/// Custom rules from config are prepended in front of these by the engine.
pub fn builtin_rules(workspace_root: &Path, extra_read_dirs: &[PathBuf]) -> Vec<PermissionRule> {
    let secret_patterns = compile(SECRET_PATH_PATTERNS);
    let mut write_blocked = compile(SECRET_PATH_PATTERNS);
    write_blocked.extend(compile(SYSTEM_PATH_PATTERNS));

    let mut read_dirs = vec![workspace_root.to_path_buf(), PathBuf::from("/tmp")];
    read_dirs.extend(extra_read_dirs.iter().cloned());

    vec![
        PermissionRule::new("deny-force-push", "*", PermissionAction::Deny)
            .with_predicate(command_is(shell::is_force_push))
            .with_log("Blocked force push"),
        PermissionRule::new("deny-hard-reset", "*", PermissionAction::Deny)
            .with_predicate(command_is(shell::is_hard_reset))
            .with_log("Blocked hard reset"),
        PermissionRule::new("deny-recursive-delete", "*", PermissionAction::Deny)
            .with_predicate(command_is(shell::is_recursive_force_rm))
            .with_log("Blocked recursive delete"),
        PermissionRule::new("deny-raw-disk-write", "*", PermissionAction::Deny)
            .with_predicate(command_is(shell::is_raw_disk_write))
            .with_log("Blocked raw disk write"),
        PermissionRule::new("deny-drop-table", "*", PermissionAction::Deny)
            .with_predicate(args_text_has(shell::has_drop_table))
            .with_log("Blocked DROP TABLE"),
        PermissionRule::new("deny-unscoped-delete", "*", PermissionAction::Deny)
            .with_predicate(args_text_has(shell::has_unscoped_delete))
            .with_log("Blocked DELETE without WHERE"),
        PermissionRule::new("deny-power-command", "*", PermissionAction::Deny)
            .with_predicate(command_is(shell::is_power_command))
            .with_log("Blocked system power command"),
        PermissionRule::new("allow-git-readonly", "*", PermissionAction::Allow)
            .with_predicate(command_is(shell::is_allowed_git_command)),
        PermissionRule::new("allow-file-read", "Read", PermissionAction::Allow).with_path_scope(
            PathScope {
                allowed_dirs: read_dirs,
                blocked_patterns: secret_patterns,
            },
        ),
        PermissionRule::new("allow-file-write", "Write", PermissionAction::Allow)
            .with_path_scope(PathScope {
                allowed_dirs: Vec::new(),
                blocked_patterns: write_blocked.clone(),
            }),
        PermissionRule::new("allow-file-edit", "Edit", PermissionAction::Allow).with_path_scope(
            PathScope {
                allowed_dirs: Vec::new(),
                blocked_patterns: write_blocked,
            },
        ),
        PermissionRule::new("ask-shell", "Bash", PermissionAction::Ask),
        PermissionRule::new("ask-fetch", "FetchURL", PermissionAction::Ask),
        PermissionRule::new("ask-web-search", "WebSearch", PermissionAction::Ask),
    ]
}
