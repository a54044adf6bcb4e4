//! Shell-command analysis for the destructive-command rules
//!
//! A command line is parsed in one pass into its constituent simple
//! commands: quote- and escape-aware, split on unquoted `;`, `|`, `&`,
//! `&&`, `||`, and newlines, with leading `NAME=value` assignments and an
//! `env` wrapper stripped away. The predicates below then inspect flags
//! per command, so `echo safe && rm -rf /` is caught while `echo "rm -rf"`
//! is not, and `-rf`, `-fr`, `-rRf`, and the long forms all count.

/// One simple command: the resolved program name (basename, lowercased)
/// plus its argument tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    /// First argument that is not a flag — `git <subcommand>`.
    pub fn subcommand(&self) -> Option<&str> {
        self.args
            .iter()
            .find(|arg| !arg.starts_with('-'))
            .map(String::as_str)
    }

    /// Whether the long flag appears verbatim, or the short letter appears
    /// inside any short-flag cluster (`-rRf` style), in either case.
    pub fn has_flag(&self, long: &str, short: char) -> bool {
        self.args
            .iter()
            .any(|arg| arg == long || short_cluster_has(arg, short))
    }
}

fn short_cluster_has(token: &str, flag: char) -> bool {
    token.starts_with('-')
        && !token.starts_with("--")
        && token.chars().skip(1).any(|c| c.eq_ignore_ascii_case(&flag))
}

/// Parse a command line into simple commands in a single scan.
pub fn parse_commands(line: &str) -> Vec<ShellCommand> {
    let mut commands = Vec::new();
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' | '\n' if !in_single && !in_double => {
                end_command(&mut commands, &mut tokens, &mut current);
            }
            '|' | '&' if !in_single && !in_double => {
                // `&&` and `||` separate just like their single forms
                if chars.peek() == Some(&c) {
                    chars.next();
                }
                end_command(&mut commands, &mut tokens, &mut current);
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                end_token(&mut tokens, &mut current);
            }
            c => current.push(c),
        }
    }
    end_command(&mut commands, &mut tokens, &mut current);
    commands
}

fn end_token(tokens: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        tokens.push(std::mem::take(current));
    }
}

fn end_command(commands: &mut Vec<ShellCommand>, tokens: &mut Vec<String>, current: &mut String) {
    end_token(tokens, current);
    if let Some(command) = resolve_command(std::mem::take(tokens)) {
        commands.push(command);
    }
}

/// Turn raw tokens into a `ShellCommand`: drop leading `NAME=value`
/// assignments, unwrap an `env` prefix (with its own flags and
/// assignments), and reduce the program to its lowercased basename.
fn resolve_command(tokens: Vec<String>) -> Option<ShellCommand> {
    let mut iter = tokens.into_iter().peekable();
    while iter.peek().is_some_and(|t| is_assignment(t)) {
        iter.next();
    }
    let mut name = program_basename(&iter.next()?);
    if name == "env" {
        while iter
            .peek()
            .is_some_and(|t| t.starts_with('-') || is_assignment(t))
        {
            iter.next();
        }
        name = program_basename(&iter.next()?);
    }
    Some(ShellCommand {
        name,
        args: iter.collect(),
    })
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn program_basename(token: &str) -> String {
    std::path::Path::new(token)
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| token.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Command predicates
// ---------------------------------------------------------------------------

/// `rm` with both the recursive and force flags, in any combination of
/// short clusters and long forms.
pub fn is_recursive_force_rm(command: &str) -> bool {
    parse_commands(command).iter().any(|cmd| {
        cmd.name == "rm" && cmd.has_flag("--recursive", 'r') && cmd.has_flag("--force", 'f')
    })
}

/// `git push` carrying `--force`, `--force-with-lease`, or a short cluster
/// with `f`.
pub fn is_force_push(command: &str) -> bool {
    parse_commands(command).iter().any(|cmd| {
        cmd.name == "git"
            && cmd.subcommand() == Some("push")
            && (cmd.has_flag("--force", 'f')
                || cmd.args.iter().any(|a| a == "--force-with-lease"))
    })
}

/// `git reset --hard`.
pub fn is_hard_reset(command: &str) -> bool {
    parse_commands(command).iter().any(|cmd| {
        cmd.name == "git"
            && cmd.subcommand() == Some("reset")
            && cmd.args.iter().any(|a| a == "--hard")
    })
}

/// `dd` writing straight to a device node.
pub fn is_raw_disk_write(command: &str) -> bool {
    parse_commands(command).iter().any(|cmd| {
        cmd.name == "dd"
            && cmd.args.iter().any(|arg| {
                arg.strip_prefix("of=")
                    .map(|target| target.starts_with("/dev/") || target.starts_with("/disk"))
                    .unwrap_or(false)
            })
    })
}

/// `shutdown`, `reboot`, `halt`, or `poweroff` anywhere in the line.
pub fn is_power_command(command: &str) -> bool {
    parse_commands(command)
        .iter()
        .any(|cmd| matches!(cmd.name.as_str(), "shutdown" | "reboot" | "halt" | "poweroff"))
}

/// Read-only / staging git subcommands that are always allowed. This is a
/// prefix rule: the first command on the line decides.
pub fn is_allowed_git_command(command: &str) -> bool {
    let commands = parse_commands(command);
    let Some(first) = commands.first() else {
        return false;
    };
    first.name == "git"
        && matches!(
            first.subcommand(),
            Some("status" | "diff" | "log" | "show" | "add" | "commit")
        )
}

// ---------------------------------------------------------------------------
// SQL predicates
// ---------------------------------------------------------------------------

/// SQL `DROP TABLE` anywhere in the text.
pub fn has_drop_table(text: &str) -> bool {
    let upper = text.to_uppercase();
    let mut rest = upper.as_str();
    while let Some(pos) = rest.find("DROP") {
        rest = &rest[pos + "DROP".len()..];
        if rest.trim_start().starts_with("TABLE") {
            return true;
        }
    }
    false
}

/// SQL `DELETE FROM <table>` with no `WHERE` in the same statement.
/// Statements are `;`-separated, so a later query's `WHERE` cannot mask an
/// unscoped delete earlier in the text.
pub fn has_unscoped_delete(text: &str) -> bool {
    text.split(';').any(statement_deletes_without_where)
}

fn statement_deletes_without_where(statement: &str) -> bool {
    let upper = statement.to_uppercase();
    let mut rest = upper.as_str();
    while let Some(pos) = rest.find("DELETE") {
        rest = &rest[pos + "DELETE".len()..];
        let Some(tail) = rest.trim_start().strip_prefix("FROM") else {
            continue;
        };
        // a target table must follow, and WHERE must scope this statement
        let has_table = tail.split_whitespace().next().is_some();
        return has_table && !tail.contains("WHERE");
    }
    false
}
