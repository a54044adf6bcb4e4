//! Counters and per-agent aggregates

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use teambridge_core::counters::{bump, read};
use teambridge_core::OpsCounters;

#[derive(Clone, Debug, Default)]
pub struct AgentAggregate {
    pub assigned: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_duration_ms: u64,
}

impl AgentAggregate {
    fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 0.0;
        }
        self.completed as f64 / finished as f64
    }

    fn avg_duration_ms(&self) -> u64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 0;
        }
        self.total_duration_ms / finished
    }
}

pub struct Metrics {
    started_at: DateTime<Utc>,
    counters: OpsCounters,
    per_agent: DashMap<String, AgentAggregate>,
}

impl Metrics {
    pub fn new(counters: OpsCounters) -> Self {
        Self {
            started_at: Utc::now(),
            counters,
            per_agent: DashMap::new(),
        }
    }

    pub fn counters(&self) -> &OpsCounters {
        &self.counters
    }

    pub fn task_assigned(&self, agent: &str) {
        self.per_agent.entry(agent.to_string()).or_default().assigned += 1;
    }

    pub fn task_completed(&self, agent: &str, duration_ms: u64) {
        bump(&self.counters.task_completed);
        let mut entry = self.per_agent.entry(agent.to_string()).or_default();
        entry.completed += 1;
        entry.total_duration_ms += duration_ms;
    }

    pub fn task_failed(&self, agent: &str, duration_ms: u64) {
        bump(&self.counters.task_failed);
        let mut entry = self.per_agent.entry(agent.to_string()).or_default();
        entry.failed += 1;
        entry.total_duration_ms += duration_ms;
    }

    pub fn task_cancelled(&self, agent: &str) {
        self.per_agent.entry(agent.to_string()).or_default().cancelled += 1;
    }

    pub fn agent_timeout(&self) {
        bump(&self.counters.agent_timeouts);
    }

    pub fn agent_spawn_failure(&self) {
        bump(&self.counters.agent_spawn_failures);
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub fn snapshot(&self, active_tasks: usize) -> Value {
        let agents: serde_json::Map<String, Value> = self
            .per_agent
            .iter()
            .map(|entry| {
                let a = entry.value();
                (
                    entry.key().clone(),
                    json!({
                        "assigned": a.assigned,
                        "completed": a.completed,
                        "failed": a.failed,
                        "cancelled": a.cancelled,
                        "success_rate": a.success_rate(),
                        "avg_duration_ms": a.avg_duration_ms(),
                    }),
                )
            })
            .collect();

        json!({
            "uptime_seconds": self.uptime_seconds(),
            "active_tasks": active_tasks,
            "totals": {
                "taskCompleted": read(&self.counters.task_completed),
                "taskFailed": read(&self.counters.task_failed),
            },
            "agents": agents,
            "operational": {
                "messageWriteFailures": read(&self.counters.message_write_failures),
                "messageDropped": read(&self.counters.message_dropped),
                "registrySaveFailures": read(&self.counters.registry_save_failures),
                "agentSpawnFailures": read(&self.counters.agent_spawn_failures),
                "agentTimeouts": read(&self.counters.agent_timeouts),
                "taskCompleted": read(&self.counters.task_completed),
                "taskFailed": read(&self.counters.task_failed),
            },
        })
    }
}
