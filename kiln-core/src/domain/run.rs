//! Run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::pipeline::PipelineDefinition;
use crate::domain::trigger::{RunRequest, RunTrigger};
use crate::error::RunStateError;

/// One execution of a pipeline definition
///
/// Mutated only by the execution engine; frozen into a [`RunRecord`] once it
/// reaches a terminal status.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub definition: Arc<PipelineDefinition>,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    status: RunStatus,
    pub step_results: Vec<StepResult>,
}

/// Run execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Pending -> Running -> {Succeeded, Failed, Cancelled}
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "Pending"),
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Succeeded => write!(f, "Succeeded"),
            RunStatus::Failed => write!(f, "Failed"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    /// None when the step never ran
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Paths relative to the run workspace, in the order the action declared them
    #[serde(default)]
    pub captured_output_paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl StepResult {
    /// Result for a step that was never started
    pub fn skipped(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
            captured_output_paths: Vec::new(),
            error: None,
        }
    }
}

impl Run {
    /// Creates a pending run for a trigger request
    pub fn new(definition: Arc<PipelineDefinition>, request: &RunRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition,
            trigger: request.trigger.clone(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Pending,
            step_results: Vec::new(),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Moves the run to `next`, enforcing the run state machine
    pub fn transition(&mut self, next: RunStatus) -> Result<(), RunStateError> {
        if !self.status.can_transition_to(next) {
            return Err(RunStateError {
                run_id: self.id,
                from: self.status,
                to: next,
            });
        }

        match next {
            RunStatus::Running => self.started_at = Utc::now(),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }

        self.status = next;
        Ok(())
    }

    /// Freezes a terminal run into its persisted form
    pub fn to_record(&self) -> Option<RunRecord> {
        if !self.status.is_terminal() {
            return None;
        }

        Some(RunRecord {
            run_id: self.id,
            definition_id: self.definition.id,
            definition_name: self.definition.name.clone(),
            trigger: self.trigger.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or(self.started_at),
            status: self.status,
            step_results: self.step_results.clone(),
        })
    }
}

/// Persisted terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub definition_id: Uuid,
    pub definition_name: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub step_results: Vec<StepResult>,
}
