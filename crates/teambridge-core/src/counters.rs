//! Process-wide operational counters
//!
//! Shared between the subsystems that produce them (bus, registry, session
//! supervisor) and the metrics surface that reports them. Cloning shares the
//! underlying atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct OpsCounters {
    pub message_write_failures: Arc<AtomicU64>,
    pub message_dropped: Arc<AtomicU64>,
    pub registry_save_failures: Arc<AtomicU64>,
    pub agent_spawn_failures: Arc<AtomicU64>,
    pub agent_timeouts: Arc<AtomicU64>,
    pub task_completed: Arc<AtomicU64>,
    pub task_failed: Arc<AtomicU64>,
}

impl OpsCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Relaxed increment helper; the counters are informational.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Relaxed read helper.
pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
