//! Service Layer
//!
//! Business logic of the orchestrator: launching runs and publishing
//! their artifacts.

pub mod publish;
pub mod run;

pub use publish::{ArtifactPublisher, PublishConfig};
pub use run::{RunOutcome, RunService};
