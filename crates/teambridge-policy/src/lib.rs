//! Teambridge Policy - declarative permission rules over agent tool calls
//!
//! The session supervisor consults this engine for every tool call the
//! spawned agent attempts. Rules are evaluated in order, first match wins,
//! and anything unmatched is denied.

pub mod engine;
pub mod rules;
pub mod shell;

pub use engine::{PermissionContext, PermissionResult, PolicyEngine};
pub use rules::{
    builtin_rules, ArgPredicate, PathScope, PermissionAction, PermissionRule,
};
