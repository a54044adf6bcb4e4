//! Teambridge ACP - agent-protocol client and session supervisor
//!
//! Drives one spawned coding agent through the
//! `initialize → newSession → prompt → teardown` cycle over line-delimited
//! JSON-RPC on the child's stdio, enforcing the permission policy on every
//! tool call the agent attempts and guaranteeing process teardown on every
//! exit path.

pub mod process;
pub mod session;
pub mod spawn;
pub mod transport;

pub use session::{
    frame_prompt, run_session, SessionHooks, SessionOptions, INIT_TIMEOUT, KILL_GRACE,
    SESSION_TIMEOUT,
};
pub use spawn::{build_env, spawn_agent, ENV_ALLOWLIST};
pub use transport::{AgentConnection, Incoming};
