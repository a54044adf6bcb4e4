//! Open-request exchange — broadcast a task solicitation, first claim wins
//!
//! Requests expire lazily: the next operation that observes an overdue
//! `open` request rewrites it to `expired`. There is no background sweeper.

use crate::messages::{MessageBus, MessageOptions};
use crate::{sortable_filename, write_json_atomic};
use chrono::Utc;
use std::path::{Path, PathBuf};
use teambridge_core::{
    Error, MessageKind, RequestStatus, Result, TaskRequest, BROADCAST_TO,
};
use tracing::{info, warn};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct CreateRequestOptions {
    pub context: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for CreateRequestOptions {
    fn default() -> Self {
        Self {
            context: None,
            timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Result of a claim attempt.
#[derive(Clone, Debug)]
pub struct ClaimOutcome {
    pub claimed: bool,
    pub request: Option<TaskRequest>,
}

impl MessageBus {
    /// Persist a request and announce it with a broadcast `request` message.
    pub fn create_request(
        &self,
        from: &str,
        description: &str,
        opts: CreateRequestOptions,
    ) -> Result<TaskRequest> {
        let request = TaskRequest {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            description: description.to_string(),
            context: opts.context,
            status: RequestStatus::Open,
            created_at: Utc::now(),
            claimed_by: None,
            claimed_at: None,
            timeout_seconds: opts.timeout_seconds,
        };
        self.persist_request(&request)?;

        let announce = MessageOptions {
            kind: MessageKind::Request,
            request_id: Some(request.id.clone()),
            reply_to: None,
        };
        // A broadcast with zero other inboxes is fine; delivery failures to
        // some inboxes should not undo the persisted request.
        if let Err(e) = self.write_message(from, BROADCAST_TO, description, announce) {
            warn!(request = %request.id, "request broadcast incomplete: {}", e);
        }

        info!(request = %request.id, from = from, "open request created");
        Ok(request)
    }

    /// Claim an open request. Exactly one claimant can win; an overdue
    /// request is rewritten to `expired` instead of being claimed.
    pub fn claim_request(&self, id: &str, claimed_by: &str) -> Result<ClaimOutcome> {
        let Some((path, mut request)) = self.find_request(id)? else {
            return Ok(ClaimOutcome {
                claimed: false,
                request: None,
            });
        };

        if request.status != RequestStatus::Open {
            return Ok(ClaimOutcome {
                claimed: false,
                request: Some(request),
            });
        }

        let now = Utc::now();
        if request.is_overdue(now) {
            request.status = RequestStatus::Expired;
            self.rewrite_request(&path, &request)?;
            return Ok(ClaimOutcome {
                claimed: false,
                request: Some(request),
            });
        }

        request.status = RequestStatus::Claimed;
        request.claimed_by = Some(claimed_by.to_string());
        request.claimed_at = Some(now);
        self.rewrite_request(&path, &request)?;

        let response = MessageOptions {
            kind: MessageKind::Response,
            request_id: Some(request.id.clone()),
            reply_to: None,
        };
        let note = format!("Request claimed by {}", claimed_by);
        if let Err(e) = self.write_message(claimed_by, &request.from, &note, response) {
            warn!(request = %request.id, "claim notification failed: {}", e);
        }

        info!(request = %request.id, by = claimed_by, "request claimed");
        Ok(ClaimOutcome {
            claimed: true,
            request: Some(request),
        })
    }

    /// Non-expired open requests, lazily expiring any found past deadline.
    pub fn list_open_requests(&self) -> Result<Vec<TaskRequest>> {
        let now = Utc::now();
        let mut open = Vec::new();
        for (path, mut request) in self.all_requests()? {
            if request.status != RequestStatus::Open {
                continue;
            }
            if request.is_overdue(now) {
                request.status = RequestStatus::Expired;
                if let Err(e) = self.rewrite_request(&path, &request) {
                    warn!(request = %request.id, "lazy expiry failed: {}", e);
                }
                continue;
            }
            open.push(request);
        }
        Ok(open)
    }

    pub fn get_request(&self, id: &str) -> Result<Option<TaskRequest>> {
        Ok(self.find_request(id)?.map(|(_, request)| request))
    }

    /// Pending open-request count for a requesting agent.
    pub fn open_request_count(&self, agent: &str) -> usize {
        self.list_open_requests()
            .map(|reqs| reqs.iter().filter(|r| r.from == agent).count())
            .unwrap_or(0)
    }

    fn persist_request(&self, request: &TaskRequest) -> Result<()> {
        let filename = sortable_filename(request.created_at, &request.id);
        write_json_atomic(&self.requests_dir().join(filename), request)
            .map_err(|e| Error::Bus(format!("cannot persist request: {}", e)))
    }

    fn rewrite_request(&self, path: &Path, request: &TaskRequest) -> Result<()> {
        write_json_atomic(path, request)
            .map_err(|e| Error::Bus(format!("cannot rewrite request {}: {}", request.id, e)))
    }

    fn find_request(&self, id: &str) -> Result<Option<(PathBuf, TaskRequest)>> {
        Ok(self
            .all_requests()?
            .into_iter()
            .find(|(_, request)| request.id == id))
    }

    fn all_requests(&self) -> Result<Vec<(PathBuf, TaskRequest)>> {
        let dir = self.requests_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(Vec::new());
        };
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut requests = Vec::new();
        for path in paths {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<TaskRequest>(&content) {
                Ok(request) => requests.push((path, request)),
                Err(e) => warn!("skipping unparseable request {}: {}", path.display(), e),
            }
        }
        Ok(requests)
    }
}
