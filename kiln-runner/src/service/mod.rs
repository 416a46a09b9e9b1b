//! Service layer for the runner
//!
//! Services contain the business logic for executing runs.

pub mod execution;

pub use execution::ExecutionEngine;
