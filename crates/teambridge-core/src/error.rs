//! Error types for Teambridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("admission rejected: {0}")]
    Admission(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("workflow error: {0}")]
    Workflow(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn admission(msg: impl Into<String>) -> Self {
        Self::Admission(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether this error is a caller mistake rather than a bridge fault.
    /// Caller mistakes are surfaced without error-severity logging.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Admission(_)
                | Self::TaskNotFound(_)
                | Self::WorkflowNotFound(_)
                | Self::AgentNotFound(_)
                | Self::MethodNotFound(_)
        )
    }
}
