//! Error taxonomy
//!
//! Configuration and plan errors are fatal and surface before any run is
//! created. Step failures are recorded on the run instead of being raised.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::artifact::Artifact;
use crate::domain::run::RunStatus;

/// A pipeline definition is malformed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Pipeline '{0}' declares no steps")]
    NoSteps(String),

    #[error("Duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("Step #{0} has an empty name")]
    EmptyStepName(usize),

    #[error("Step '{0}' has an empty action")]
    EmptyAction(String),

    #[error("Step '{0}' has a zero timeout")]
    ZeroTimeout(String),

    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Duplicate artifact name '{0}'")]
    DuplicateArtifact(String),

    #[error("Artifact #{0} has an empty name")]
    EmptyArtifactName(usize),

    #[error("Artifact '{0}' has an empty path pattern")]
    EmptyArtifactPath(String),

    #[error("Unknown action(s): {}", .0.join(", "))]
    UnknownActions(Vec<String>),

    #[error("Failed to parse pipeline definition: {0}")]
    Parse(String),
}

/// The declared step dependencies cannot be turned into a plan
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Cannot build a plan without steps")]
    Empty,

    #[error("Duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle between steps: {}", .steps.join(", "))]
    Cycle { steps: Vec<String> },
}

/// Invalid run status transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Run {run_id} cannot move from {from:?} to {to:?}")]
pub struct RunStateError {
    pub run_id: Uuid,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// An action reported failure
///
/// Recorded on the step result, never raised past the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepExecutionError {
    #[error("Action '{0}' is not registered")]
    UnknownAction(String),

    #[error("Action exited with code {0}")]
    NonZeroExit(i32),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Action panicked: {0}")]
    Panicked(String),

    #[error("Step timed out after {0} seconds")]
    TimedOut(u64),

    #[error("Failed to prepare step context: {0}")]
    Context(String),
}

/// Publishing the artifacts of a run failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("Run {run_id} is {status:?}; only succeeded runs are published")]
    RunNotSucceeded { run_id: Uuid, status: RunStatus },

    #[error("Artifact '{name}' matched no files for pattern '{pattern}'")]
    EmptyArtifact { name: String, pattern: String },

    #[error("Storing artifact '{name}' failed after {attempts} attempt(s): {message}")]
    Storage {
        name: String,
        attempts: u32,
        message: String,
        /// Artifacts of the same run stored before the failure
        stored: Vec<Artifact>,
    },
}

impl PublishError {
    /// Check if this error came from the storage collaborator
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    /// Artifacts that were persisted before publishing failed
    pub fn stored_artifacts(&self) -> &[Artifact] {
        match self {
            Self::Storage { stored, .. } => stored,
            _ => &[],
        }
    }
}
