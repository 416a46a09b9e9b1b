//! Kiln Orchestrator
//!
//! Decides when pipelines run and keeps track of what they produced.
//!
//! Architecture:
//! - Configuration: settings loaded from the environment or defaults
//! - Trigger: schedule and manual dispatch evaluation per definition
//! - Repository: the run ledger
//! - Storage: the artifact storage collaborator
//! - Services: run lifecycle and artifact publishing
//! - Scheduler: the dispatch loop launching runs

pub mod config;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod trigger;

pub use config::{ConcurrencyPolicy, OrchestratorConfig};
pub use repository::{LedgerError, RunLedger};
pub use scheduler::{Dispatcher, RegistrationError};
pub use service::{ArtifactPublisher, PublishConfig, RunOutcome, RunService};
pub use storage::{ArtifactStore, LocalArtifactStore, StoreError};
pub use trigger::{TriggerEvaluator, TriggerState};
