//! Per-agent inboxes with broadcast fan-out

use crate::{create_private_dir, sortable_filename, write_json_atomic};
use chrono::Utc;
use std::path::PathBuf;
use teambridge_core::counters::bump;
use teambridge_core::{
    truncate_to, Error, Message, MessageKind, OpsCounters, Result, BROADCAST_TO, INBOX_CAP,
    MAX_MESSAGE_CONTENT,
};
use tracing::{debug, warn};

/// Options for `write_message`.
#[derive(Clone, Debug)]
pub struct MessageOptions {
    pub kind: MessageKind,
    pub request_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            kind: MessageKind::Message,
            request_id: None,
            reply_to: None,
        }
    }
}

impl MessageOptions {
    pub fn kind(kind: MessageKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }
}

/// Filter for `read_inbox`.
#[derive(Clone, Debug, Default)]
pub struct InboxFilter {
    pub from_agent: Option<String>,
    pub unread_only: bool,
}

/// File-backed inboxes and the open-request exchange under one bridge root.
#[derive(Clone)]
pub struct MessageBus {
    root: PathBuf,
    counters: OpsCounters,
}

impl MessageBus {
    /// Open the bus, creating the directory layout with 0700 permissions.
    pub fn new(root: impl Into<PathBuf>, counters: OpsCounters) -> Result<Self> {
        let root = root.into();
        create_private_dir(&root)?;
        let bus = Self { root, counters };
        create_private_dir(&bus.messages_dir())?;
        create_private_dir(&bus.requests_dir())?;
        Ok(bus)
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub(crate) fn messages_dir(&self) -> PathBuf {
        self.root.join("messages")
    }

    pub(crate) fn requests_dir(&self) -> PathBuf {
        self.root.join("requests")
    }

    pub(crate) fn inbox_dir(&self, agent: &str) -> PathBuf {
        self.messages_dir().join(agent)
    }

    pub(crate) fn counters(&self) -> &OpsCounters {
        &self.counters
    }

    /// Ensure an inbox directory exists so broadcasts reach this agent.
    pub fn ensure_inbox(&self, agent: &str) -> Result<()> {
        create_private_dir(&self.inbox_dir(agent))?;
        Ok(())
    }

    /// Names of every agent with an inbox directory.
    pub fn list_inboxes(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.messages_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    /// Write a message. `to = "all"` fans out to every inbox except the
    /// sender's; per-recipient failures are aggregated into one error.
    pub fn write_message(
        &self,
        from: &str,
        to: &str,
        content: &str,
        opts: MessageOptions,
    ) -> Result<Message> {
        let mut content = content.to_string();
        if truncate_to(&mut content, MAX_MESSAGE_CONTENT) {
            warn!(
                from = from,
                to = to,
                "message content truncated to {} bytes",
                MAX_MESSAGE_CONTENT
            );
        }

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            kind: opts.kind,
            from: from.to_string(),
            to: to.to_string(),
            content,
            timestamp: Utc::now(),
            request_id: opts.request_id,
            reply_to: opts.reply_to,
            read: false,
        };

        if to == BROADCAST_TO {
            let recipients: Vec<String> = self
                .list_inboxes()
                .into_iter()
                .filter(|name| name != from)
                .collect();
            let total = recipients.len();
            let mut failures = 0usize;
            for recipient in recipients {
                let mut copy = message.clone();
                copy.to = recipient.clone();
                if let Err(e) = self.deliver(&recipient, &copy) {
                    failures += 1;
                    bump(&self.counters.message_write_failures);
                    warn!(recipient = %recipient, "broadcast delivery failed: {}", e);
                }
            }
            if failures > 0 {
                return Err(Error::Bus(format!(
                    "broadcast failed for {} of {} recipients",
                    failures, total
                )));
            }
            debug!(from = from, recipients = total, "broadcast delivered");
        } else {
            self.deliver(to, &message).map_err(|e| {
                bump(&self.counters.message_write_failures);
                e
            })?;
        }

        Ok(message)
    }

    /// Write one message file into a single inbox, pruning the oldest files
    /// first when the inbox is at capacity.
    fn deliver(&self, recipient: &str, message: &Message) -> Result<()> {
        let inbox = self.inbox_dir(recipient);
        create_private_dir(&inbox)?;
        self.prune_inbox(recipient)?;

        let filename = sortable_filename(message.timestamp, &message.id);
        write_json_atomic(&inbox.join(filename), message)
            .map_err(|e| Error::Bus(format!("cannot write to inbox '{}': {}", recipient, e)))
    }

    /// Keep the inbox below `INBOX_CAP` by deleting the lexicographically
    /// smallest (oldest) files until exactly `INBOX_CAP - 1` remain.
    fn prune_inbox(&self, agent: &str) -> Result<()> {
        let mut files = self.inbox_files(agent);
        if files.len() < INBOX_CAP {
            return Ok(());
        }
        files.sort();
        let excess = files.len() - (INBOX_CAP - 1);
        for path in files.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("cannot prune inbox file {}: {}", path.display(), e);
            } else {
                bump(&self.counters.message_dropped);
            }
        }
        warn!(
            agent = agent,
            dropped = excess,
            "inbox at capacity, oldest messages dropped"
        );
        Ok(())
    }

    fn inbox_files(&self, agent: &str) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.inbox_dir(agent)) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect()
    }

    /// Read an inbox in creation order. Unparseable files are skipped with a
    /// warning; a missing inbox reads as empty.
    pub fn read_inbox(&self, agent: &str, filter: &InboxFilter) -> Result<Vec<Message>> {
        let mut files = self.inbox_files(agent);
        files.sort();

        let mut messages = Vec::new();
        for path in files {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("cannot read inbox file {}: {}", path.display(), e);
                    continue;
                }
            };
            let message: Message = match serde_json::from_str(&content) {
                Ok(m) => m,
                Err(e) => {
                    warn!("skipping unparseable inbox file {}: {}", path.display(), e);
                    continue;
                }
            };
            if let Some(from) = &filter.from_agent {
                if &message.from != from {
                    continue;
                }
            }
            if filter.unread_only && message.read {
                continue;
            }
            messages.push(message);
        }
        Ok(messages)
    }

    /// Rewrite matching messages with `read = true`. Returns the count changed.
    pub fn mark_read(&self, agent: &str, ids: &[String]) -> Result<usize> {
        let mut files = self.inbox_files(agent);
        files.sort();

        let mut changed = 0usize;
        for path in files {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(mut message) = serde_json::from_str::<Message>(&content) else {
                continue;
            };
            if !ids.contains(&message.id) || message.read {
                continue;
            }
            message.read = true;
            match write_json_atomic(&path, &message) {
                Ok(()) => changed += 1,
                Err(e) => warn!("cannot mark {} read: {}", path.display(), e),
            }
        }
        Ok(changed)
    }

    /// Mark the currently unread set as read.
    pub fn mark_all_read(&self, agent: &str) -> Result<usize> {
        let unread = self.get_unread_messages(agent)?;
        let ids: Vec<String> = unread.into_iter().map(|m| m.id).collect();
        self.mark_read(agent, &ids)
    }

    pub fn get_unread_messages(&self, agent: &str) -> Result<Vec<Message>> {
        self.read_inbox(
            agent,
            &InboxFilter {
                from_agent: None,
                unread_only: true,
            },
        )
    }

    pub fn get_unread_count(&self, agent: &str) -> usize {
        self.get_unread_messages(agent)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Delete one agent's inbox.
    pub fn cleanup(&self, agent: &str) -> Result<()> {
        let inbox = self.inbox_dir(agent);
        if inbox.exists() {
            std::fs::remove_dir_all(&inbox)
                .map_err(|e| Error::Bus(format!("cannot clean inbox '{}': {}", agent, e)))?;
        }
        Ok(())
    }

    /// Delete every inbox and every request file.
    pub fn cleanup_all(&self) -> Result<()> {
        for agent in self.list_inboxes() {
            self.cleanup(&agent)?;
        }
        let requests = self.requests_dir();
        if requests.exists() {
            for entry in std::fs::read_dir(&requests)
                .map_err(|e| Error::Bus(format!("cannot list requests: {}", e)))?
                .flatten()
            {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("cannot remove request file {}: {}", entry.path().display(), e);
                }
            }
        }
        Ok(())
    }
}
