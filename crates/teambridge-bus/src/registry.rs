//! Agent registry — single-file JSON list with atomic persistence
//!
//! Every mutation rewrites the full list: serialize, write a sibling .tmp,
//! fsync, rename over the canonical path. A failed persist logs and counts
//! `registry_save_failures` but does not raise; callers proceed against the
//! in-memory state on a best-effort basis.

use chrono::Utc;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use teambridge_core::counters::bump;
use teambridge_core::{AgentRegistryEntry, AgentStatus, OpsCounters};
use tracing::{debug, info, warn};

/// How often live agents are expected to heartbeat.
pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// Heartbeat age beyond which an agent is probed and may be marked dead.
pub const DEAD_THRESHOLD_MS: i64 = 30_000;

pub struct AgentRegistry {
    path: PathBuf,
    entries: Mutex<Vec<AgentRegistryEntry>>,
    counters: OpsCounters,
}

impl AgentRegistry {
    /// Open the registry file, tolerating a missing or corrupt file.
    pub fn open(path: impl Into<PathBuf>, counters: OpsCounters) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<AgentRegistryEntry>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("corrupt registry file {}: {} — starting empty", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
            counters,
        }
    }

    /// Register (or re-register) an agent. Any prior entry with the same
    /// name is replaced atomically.
    pub fn register(&self, name: &str, model: &str, pid: Option<u32>) -> AgentRegistryEntry {
        let now = Utc::now();
        let entry = AgentRegistryEntry {
            name: name.to_string(),
            status: AgentStatus::Running,
            model: model.to_string(),
            current_task: None,
            registered_at: now,
            last_heartbeat: now,
            last_activity: now,
            pid,
            pending_messages: 0,
            open_requests: 0,
        };
        {
            let mut entries = self.lock();
            entries.retain(|e| e.name != name);
            entries.push(entry.clone());
            self.persist(&entries);
        }
        info!(agent = name, model = model, "agent registered");
        entry
    }

    /// Remove an agent. Returns whether anything changed.
    pub fn deregister(&self, name: &str) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        let changed = entries.len() != before;
        if changed {
            self.persist(&entries);
            debug!(agent = name, "agent deregistered");
        }
        changed
    }

    pub fn get(&self, name: &str) -> Option<AgentRegistryEntry> {
        self.lock().iter().find(|e| e.name == name).cloned()
    }

    pub fn get_all(&self) -> Vec<AgentRegistryEntry> {
        self.lock().clone()
    }

    /// All entries except `dead` ones.
    pub fn get_active(&self) -> Vec<AgentRegistryEntry> {
        self.lock()
            .iter()
            .filter(|e| e.status != AgentStatus::Dead)
            .cloned()
            .collect()
    }

    pub fn update_status(
        &self,
        name: &str,
        status: AgentStatus,
        current_task: Option<String>,
    ) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.name == name) else {
            return false;
        };
        entry.status = status;
        entry.current_task = current_task;
        entry.last_activity = Utc::now();
        self.persist(&entries);
        true
    }

    pub fn heartbeat(&self, name: &str) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.name == name) else {
            return false;
        };
        entry.last_heartbeat = Utc::now();
        self.persist(&entries);
        true
    }

    pub fn update_message_counts(&self, name: &str, pending_msgs: u32, pending_reqs: u32) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.name == name) else {
            return false;
        };
        entry.pending_messages = pending_msgs;
        entry.open_requests = pending_reqs;
        self.persist(&entries);
        true
    }

    /// Probe every non-dead entry with a stale heartbeat; entries whose
    /// recorded PID is gone are marked dead. Returns the names transitioned.
    pub fn detect_dead(&self) -> Vec<String> {
        let now = Utc::now();
        let mut died = Vec::new();
        let mut entries = self.lock();
        for entry in entries.iter_mut() {
            if entry.status == AgentStatus::Dead {
                continue;
            }
            let age_ms = (now - entry.last_heartbeat).num_milliseconds();
            if age_ms <= DEAD_THRESHOLD_MS {
                continue;
            }
            let alive = entry.pid.map(pid_alive).unwrap_or(false);
            if !alive {
                entry.status = AgentStatus::Dead;
                died.push(entry.name.clone());
            }
        }
        if !died.is_empty() {
            self.persist(&entries);
            warn!(agents = ?died, "agents marked dead");
        }
        died
    }

    /// Remove all dead entries. Returns the count removed.
    pub fn prune_dead_agents(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.status != AgentStatus::Dead);
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries);
        }
        removed
    }

    /// Reset to empty.
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        self.persist(&entries);
    }

    pub fn uptime_seconds(&self, name: &str) -> Option<i64> {
        self.get(name)
            .map(|e| (Utc::now() - e.registered_at).num_seconds())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AgentRegistryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Full-list atomic write: tmp + fsync + rename. Never raises.
    fn persist(&self, entries: &[AgentRegistryEntry]) {
        if let Err(e) = self.persist_inner(entries) {
            bump(&self.counters.registry_save_failures);
            warn!("registry save failed: {}", e);
        }
    }

    fn persist_inner(&self, entries: &[AgentRegistryEntry]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Signal-0 liveness probe.
#[cfg(unix)]
#[allow(unsafe_code)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: `kill(pid, 0)` performs only the permission/existence check
    // defined by POSIX `kill(2)`; no signal is delivered.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, AgentRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = AgentRegistry::open(dir.path().join("agents.json"), OpsCounters::new());
        (dir, reg)
    }

    #[test]
    fn register_replaces_prior_entry() {
        let (_dir, reg) = registry();
        reg.register("alpha", "model-a", None);
        reg.register("alpha", "model-b", Some(123));
        let all = reg.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].model, "model-b");
        assert_eq!(all[0].pid, Some(123));
    }

    #[test]
    fn deregister_is_idempotent() {
        let (_dir, reg) = registry();
        reg.register("alpha", "m", None);
        assert!(reg.deregister("alpha"));
        assert!(!reg.deregister("alpha"));
        assert!(reg.get_all().is_empty());
    }

    #[test]
    fn persisted_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        {
            let reg = AgentRegistry::open(&path, OpsCounters::new());
            reg.register("alpha", "m", None);
        }
        let reg = AgentRegistry::open(&path, OpsCounters::new());
        assert!(reg.get("alpha").is_some());
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        std::fs::write(&path, "{not json").unwrap();
        let reg = AgentRegistry::open(&path, OpsCounters::new());
        assert!(reg.get_all().is_empty());
    }

    #[test]
    fn update_status_touches_activity() {
        let (_dir, reg) = registry();
        reg.register("alpha", "m", None);
        assert!(reg.update_status("alpha", AgentStatus::Waiting, Some("t1".into())));
        let entry = reg.get("alpha").unwrap();
        assert_eq!(entry.status, AgentStatus::Waiting);
        assert_eq!(entry.current_task.as_deref(), Some("t1"));
        assert!(!reg.update_status("ghost", AgentStatus::Idle, None));
    }

    #[test]
    fn detect_dead_marks_stale_entry_with_gone_pid() {
        let (_dir, reg) = registry();
        reg.register("stale", "m", Some(u32::MAX - 1));
        {
            let mut entries = reg.entries.lock().unwrap();
            entries[0].last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        }
        let died = reg.detect_dead();
        assert_eq!(died, vec!["stale".to_string()]);
        assert_eq!(reg.get("stale").unwrap().status, AgentStatus::Dead);
        assert!(reg.get_active().is_empty());

        // dead is terminal until pruned
        assert!(reg.detect_dead().is_empty());
        assert_eq!(reg.prune_dead_agents(), 1);
        assert!(reg.get_all().is_empty());
    }

    #[test]
    fn live_pid_not_marked_dead() {
        let (_dir, reg) = registry();
        reg.register("me", "m", Some(std::process::id()));
        {
            let mut entries = reg.entries.lock().unwrap();
            entries[0].last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        }
        assert!(reg.detect_dead().is_empty());
    }

    #[test]
    fn heartbeat_and_counts() {
        let (_dir, reg) = registry();
        reg.register("alpha", "m", None);
        let before = reg.get("alpha").unwrap().last_heartbeat;
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(reg.heartbeat("alpha"));
        assert!(reg.get("alpha").unwrap().last_heartbeat > before);

        assert!(reg.update_message_counts("alpha", 3, 1));
        let entry = reg.get("alpha").unwrap();
        assert_eq!(entry.pending_messages, 3);
        assert_eq!(entry.open_requests, 1);
    }

    #[test]
    fn uptime_counts_from_registration() {
        let (_dir, reg) = registry();
        reg.register("alpha", "m", None);
        assert!(reg.uptime_seconds("alpha").unwrap() >= 0);
        assert!(reg.uptime_seconds("ghost").is_none());
    }
}
