//! Teambridge Server - the orchestrator-facing tool-call surface
//!
//! Receives newline-delimited JSON-RPC on stdin, dispatches the 14 bridge
//! tools, applies admission control and pruning, and coordinates the session
//! supervisor, workflow engine, bus, registry, and durable store.

pub mod handlers;
pub mod hooks;
pub mod metrics;
pub mod server;
pub mod state;
pub mod tools;
pub mod workflow;

pub use server::{graceful_shutdown, run_stdio_server};
pub use state::{BridgeState, SharedState, TaskEntry};
pub use workflow::{StepOutcome, StepRunner, WorkflowEngine};
