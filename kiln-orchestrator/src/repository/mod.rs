//! Repository Module
//!
//! Data access layer for the orchestrator.

pub mod ledger;

pub use ledger::{LedgerError, RunLedger};
