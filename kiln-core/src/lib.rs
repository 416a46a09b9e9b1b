//! Kiln Core
//!
//! Core types and abstractions for the Kiln build-and-release engine.
//!
//! This crate contains:
//! - Domain types: pipeline definitions, runs, step results, artifacts
//! - Schedule: cron expressions used by schedule triggers
//! - Plan: the step graph builder turning declared steps into an execution order
//! - Errors shared by the runner and the orchestrator

pub mod domain;
pub mod error;
pub mod plan;
pub mod schedule;

pub use error::{ConfigError, PlanError, PublishError, RunStateError, StepExecutionError};
pub use plan::{ExecutionPlan, build_plan};
pub use schedule::CronSchedule;
