//! Bridge-side session hooks — messaging context injection and pid tracking

use crate::state::SharedState;
use async_trait::async_trait;
use teambridge_acp::SessionHooks;
use tracing::{debug, warn};

/// Wires one supervised session to the bus, registry, and task table.
pub struct BridgeHooks {
    pub state: SharedState,
    pub task_id: String,
    pub agent: String,
    pub model: String,
}

#[async_trait]
impl SessionHooks for BridgeHooks {
    fn on_spawned(&self, pid: u32) {
        if let Some(mut entry) = self.state.tasks.get_mut(&self.task_id) {
            entry.pid = Some(pid);
        }
        debug!(task = %self.task_id, pid = pid, "agent process attached");
    }

    /// Register the agent and drain its unread inbox into a fenced context
    /// block ahead of the prompt.
    async fn inject_context(&self, agent: &str) -> Option<String> {
        let messaging_enabled = {
            let config = self.state.config.read().await;
            config.messaging.enabled
        };
        if !messaging_enabled {
            return None;
        }

        let pid = self
            .state
            .tasks
            .get(&self.task_id)
            .and_then(|entry| entry.pid);
        self.state.registry.register(agent, &self.model, pid);
        self.state
            .registry
            .update_status(agent, teambridge_core::AgentStatus::Running, Some(self.task_id.clone()));
        if let Err(e) = self.state.bus.ensure_inbox(agent) {
            warn!(agent = agent, "cannot create inbox: {}", e);
            return None;
        }

        let unread = match self.state.bus.get_unread_messages(agent) {
            Ok(unread) => unread,
            Err(e) => {
                warn!(agent = agent, "cannot read inbox: {}", e);
                return None;
            }
        };
        if unread.is_empty() {
            return None;
        }

        let mut block = String::from("Messages from your teammates:\n```\n");
        for message in &unread {
            block.push_str(&format!(
                "[{} → {}] {}\n",
                message.from, message.to, message.content
            ));
        }
        block.push_str("```");

        let ids: Vec<String> = unread.iter().map(|m| m.id.clone()).collect();
        match self.state.bus.mark_read(agent, &ids) {
            Ok(count) => debug!(agent = agent, count = count, "inbox drained into context"),
            Err(e) => warn!(agent = agent, "cannot mark inbox read: {}", e),
        }
        Some(block)
    }

    async fn on_error(&self, agent: &str) {
        self.state.registry.deregister(agent);
    }

    fn on_tool_call(&self, agent: &str) {
        if let Some(mut entry) = self.state.tasks.get_mut(&self.task_id) {
            entry.task.tool_calls += 1;
        }
        // Tool activity doubles as liveness
        self.state.registry.heartbeat(agent);
    }
}
