//! Core domain types
//!
//! This module contains the core domain structures used across Kiln crates.
//! They are shared between the runner (executes runs) and the orchestrator
//! (triggers, records and publishes them).

pub mod artifact;
pub mod pipeline;
pub mod run;
pub mod trigger;
