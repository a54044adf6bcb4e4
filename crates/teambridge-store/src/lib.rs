//! Teambridge Store - durable task records for crash recovery
//!
//! A single `tasks` table keyed by task id. All operations are synchronous
//! and atomic with respect to the backing file; write failures raise and
//! callers decide policy. On startup `recover_orphaned` marks any row still
//! `running` as failed.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use teambridge_core::{Error, Result, Task, TaskStatus};
use tracing::{info, warn};

/// Error message stamped onto tasks left running by a previous process.
pub const ORPHAN_ERROR: &str = "Bridge restarted — task orphaned";

/// Partial update applied with a selective `UPDATE ... WHERE id = ?`.
#[derive(Clone, Debug, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<Option<String>>,
    pub tool_calls: Option<u32>,
    pub output_bytes: Option<u64>,
}

impl TaskPatch {
    /// Terminal patch used by task finalization.
    pub fn finish(
        status: TaskStatus,
        output: String,
        error: Option<String>,
        tool_calls: u32,
    ) -> Self {
        let output_bytes = output.len() as u64;
        Self {
            status: Some(status),
            completed_at: Some(Utc::now()),
            output: Some(output),
            error: Some(error),
            tool_calls: Some(tool_calls),
            output_bytes: Some(output_bytes),
        }
    }
}

#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("cannot open {}: {}", path.display(), e)))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("cannot open in-memory store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id           TEXT PRIMARY KEY,
                agent        TEXT NOT NULL,
                model        TEXT NOT NULL,
                project      TEXT NOT NULL,
                prompt       TEXT NOT NULL,
                status       TEXT NOT NULL,
                started_at   TEXT NOT NULL,
                completed_at TEXT,
                output       TEXT NOT NULL DEFAULT '',
                error        TEXT,
                tool_calls   INTEGER NOT NULL DEFAULT 0,
                output_bytes INTEGER NOT NULL DEFAULT 0,
                team         TEXT
            );",
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace the full row.
    pub fn save(&self, task: &Task) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tasks
             (id, agent, model, project, prompt, status, started_at, completed_at,
              output, error, tool_calls, output_bytes, team)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                task.id,
                task.agent,
                task.model,
                task.project,
                task.prompt,
                task.status.to_string(),
                ts(task.started_at),
                task.completed_at.map(ts),
                task.output,
                task.error,
                task.tool_calls,
                task.output_bytes,
                task.team,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, agent, model, project, prompt, status, started_at, completed_at,
                    output, error, tool_calls, output_bytes, team
             FROM tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()
        .map_err(store_err)
    }

    /// Apply a partial update. Returns whether a row changed.
    pub fn update(&self, id: &str, patch: &TaskPatch) -> Result<bool> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = patch.status {
            sets.push(format!("status = ?{}", sets.len() + 1));
            values.push(Box::new(status.to_string()));
        }
        if let Some(completed_at) = patch.completed_at {
            sets.push(format!("completed_at = ?{}", sets.len() + 1));
            values.push(Box::new(ts(completed_at)));
        }
        if let Some(output) = &patch.output {
            sets.push(format!("output = ?{}", sets.len() + 1));
            values.push(Box::new(output.clone()));
        }
        if let Some(error) = &patch.error {
            sets.push(format!("error = ?{}", sets.len() + 1));
            values.push(Box::new(error.clone()));
        }
        if let Some(tool_calls) = patch.tool_calls {
            sets.push(format!("tool_calls = ?{}", sets.len() + 1));
            values.push(Box::new(tool_calls));
        }
        if let Some(output_bytes) = patch.output_bytes {
            sets.push(format!("output_bytes = ?{}", sets.len() + 1));
            values.push(Box::new(output_bytes as i64));
        }
        if sets.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE tasks SET {} WHERE id = ?{}",
            sets.join(", "),
            sets.len() + 1
        );
        values.push(Box::new(id.to_string()));

        let conn = self.lock();
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let changed = conn.execute(&sql, refs.as_slice()).map_err(store_err)?;
        Ok(changed > 0)
    }

    pub fn list_running(&self) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, agent, model, project, prompt, status, started_at, completed_at,
                        output, error, tool_calls, output_bytes, team
                 FROM tasks WHERE status = 'running' ORDER BY started_at",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], row_to_task)
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    /// Delete non-running tasks whose completion predates `now - older_than_ms`.
    /// Returns the number of rows removed.
    pub fn prune(&self, older_than_ms: i64) -> Result<usize> {
        let cutoff = ts(Utc::now() - chrono::Duration::milliseconds(older_than_ms));
        let conn = self.lock();
        let removed = conn
            .execute(
                "DELETE FROM tasks
                 WHERE status != 'running'
                   AND completed_at IS NOT NULL
                   AND completed_at < ?1",
                params![cutoff],
            )
            .map_err(store_err)?;
        if removed > 0 {
            info!("pruned {} stored tasks older than {}ms", removed, older_than_ms);
        }
        Ok(removed)
    }

    /// Mark every row still `running` as failed. Returns the ids touched.
    pub fn recover_orphaned(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id FROM tasks WHERE status = 'running'")
            .map_err(store_err)?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        drop(stmt);

        if ids.is_empty() {
            return Ok(ids);
        }

        let now = ts(Utc::now());
        conn.execute(
            "UPDATE tasks
             SET status = 'failed', error = ?1, completed_at = ?2
             WHERE status = 'running'",
            params![ORPHAN_ERROR, now],
        )
        .map_err(store_err)?;
        warn!("recovered {} orphaned tasks", ids.len());
        Ok(ids)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a previous panic mid-statement; the
        // connection itself is still serviceable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn store_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

/// Fixed-width RFC 3339 so string comparison in SQL matches time order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(5)?;
    let started_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        agent: row.get(1)?,
        model: row.get(2)?,
        project: row.get(3)?,
        prompt: row.get(4)?,
        status: TaskStatus::from_str(&status_str).unwrap_or(TaskStatus::Failed),
        started_at: parse_ts(&started_at),
        completed_at: completed_at.as_deref().map(parse_ts),
        output: row.get(8)?,
        error: row.get(9)?,
        tool_calls: row.get(10)?,
        output_bytes: row.get::<_, i64>(11)? as u64,
        team: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    #[test]
    fn save_and_get_round_trip() {
        let store = store();
        let task = Task::new("droid", "gpt-5", "proj", "echo hi", Some("alpha".into()));
        store.save(&task).unwrap();

        let loaded = store.get(&task.id).unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.agent, "droid");
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.team.as_deref(), Some("alpha"));
        assert!(loaded.completed_at.is_none());
    }

    #[test]
    fn get_missing_returns_none() {
        assert!(store().get("nope").unwrap().is_none());
    }

    #[test]
    fn update_merges_partial_over_saved() {
        let store = store();
        let task = Task::new("droid", "gpt-5", "proj", "echo hi", None);
        store.save(&task).unwrap();

        let patch = TaskPatch::finish(TaskStatus::Completed, "hi".into(), None, 3);
        assert!(store.update(&task.id, &patch).unwrap());

        let loaded = store.get(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.output, "hi");
        assert_eq!(loaded.tool_calls, 3);
        assert!(loaded.completed_at.is_some());
        // untouched fields survive
        assert_eq!(loaded.prompt, "echo hi");
    }

    #[test]
    fn update_missing_row_returns_false() {
        let store = store();
        let patch = TaskPatch {
            status: Some(TaskStatus::Failed),
            ..Default::default()
        };
        assert!(!store.update("missing", &patch).unwrap());
    }

    #[test]
    fn empty_patch_is_a_no_op() {
        let store = store();
        assert!(!store.update("any", &TaskPatch::default()).unwrap());
    }

    #[test]
    fn list_running_filters_terminal() {
        let store = store();
        let running = Task::new("droid", "m", "p", "x", None);
        let mut done = Task::new("droid", "m", "p", "y", None);
        done.status = TaskStatus::Completed;
        done.completed_at = Some(Utc::now());
        store.save(&running).unwrap();
        store.save(&done).unwrap();

        let listed = store.list_running().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, running.id);
    }

    #[test]
    fn recover_orphaned_marks_failed() {
        let store = store();
        let task = Task::new("droid", "m", "p", "x", None);
        store.save(&task).unwrap();

        let recovered = store.recover_orphaned().unwrap();
        assert_eq!(recovered, vec![task.id.clone()]);

        let loaded = store.get(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert!(loaded.error.as_deref().unwrap().contains("orphaned"));
        assert!(loaded.completed_at.is_some());

        // Second pass finds nothing
        assert!(store.recover_orphaned().unwrap().is_empty());
    }

    #[test]
    fn prune_drops_old_terminal_rows_only() {
        let store = store();
        let running = Task::new("droid", "m", "p", "x", None);
        let mut old_done = Task::new("droid", "m", "p", "y", None);
        old_done.status = TaskStatus::Completed;
        old_done.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        let mut fresh_done = Task::new("droid", "m", "p", "z", None);
        fresh_done.status = TaskStatus::Failed;
        fresh_done.completed_at = Some(Utc::now());

        store.save(&running).unwrap();
        store.save(&old_done).unwrap();
        store.save(&fresh_done).unwrap();

        let removed = store.prune(60 * 60 * 1000).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&old_done.id).unwrap().is_none());
        assert!(store.get(&running.id).unwrap().is_some());
        assert!(store.get(&fresh_done.id).unwrap().is_some());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let task = Task::new("droid", "m", "p", "x", None);
        {
            let store = TaskStore::open(&path).unwrap();
            store.save(&task).unwrap();
        }
        let store = TaskStore::open(&path).unwrap();
        assert!(store.get(&task.id).unwrap().is_some());
    }
}
