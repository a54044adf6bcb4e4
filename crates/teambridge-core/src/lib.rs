//! Teambridge Core - Types, config, protocol, and error handling

pub mod config;
pub mod counters;
pub mod error;
pub mod protocol;
pub mod redact;
pub mod retry;
pub mod types;

pub use config::*;
pub use counters::OpsCounters;
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
