//! Kiln Runner
//!
//! Executes pipeline runs step by step.
//!
//! Architecture:
//! - Configuration: engine settings loaded from the environment or defaults
//! - Context: run workspaces and per-step isolated execution contexts
//! - Actions: the capability trait implemented by step actions, the
//!   registry resolving action names, and the built-in actions
//! - Services: the execution engine driving a run through its plan

pub mod action;
pub mod config;
pub mod context;
pub mod service;

pub use action::{Action, ActionInvocation, ActionOutcome, ActionRegistry, ActionStatus};
pub use config::EngineConfig;
pub use context::{RunScope, StepContext};
pub use service::ExecutionEngine;
