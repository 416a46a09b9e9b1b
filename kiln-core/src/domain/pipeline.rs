//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

use crate::domain::trigger::TriggerSpec;
use crate::error::ConfigError;

/// Pipeline definition
///
/// Loaded once and shared read-only by every run started from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
}

/// One declared step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,

    /// Name of the action capability that performs the step
    pub action: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub continue_on_error: bool,

    /// Steps that must run before this one
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub after: BTreeSet<String>,

    /// Step-level environment, layered over the pipeline environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// A named set of files to publish after a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,

    /// Glob matched against the output paths captured during the run
    pub path: String,
}

impl PipelineDefinition {
    /// Parses a JSON pipeline definition and validates it
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        let definition: Self =
            serde_json::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Checks the structural invariants of the definition
    ///
    /// Schedule expressions are validated when they are parsed, so a
    /// definition holding a `CronSchedule` already has valid schedules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::NoSteps(self.name.clone()));
        }

        let mut step_names = HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(ConfigError::EmptyStepName(idx + 1));
            }
            if step.action.trim().is_empty() {
                return Err(ConfigError::EmptyAction(step.name.clone()));
            }
            if step.timeout_seconds == Some(0) {
                return Err(ConfigError::ZeroTimeout(step.name.clone()));
            }
            if !step_names.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateStep(step.name.clone()));
            }
        }

        let mut artifact_names = HashSet::new();
        for (idx, artifact) in self.artifacts.iter().enumerate() {
            if artifact.name.trim().is_empty() {
                return Err(ConfigError::EmptyArtifactName(idx + 1));
            }
            if artifact.path.trim().is_empty() {
                return Err(ConfigError::EmptyArtifactPath(artifact.name.clone()));
            }
            if !artifact_names.insert(artifact.name.as_str()) {
                return Err(ConfigError::DuplicateArtifact(artifact.name.clone()));
            }
        }

        Ok(())
    }

    /// Returns true if the definition accepts manual dispatch
    pub fn is_manually_dispatchable(&self) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, TriggerSpec::ManualDispatch))
    }

    /// Finds a step by name
    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }
}

impl StepSpec {
    /// Creates a step with no parameters
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            parameters: BTreeMap::new(),
            continue_on_error: false,
            after: BTreeSet::new(),
            env: BTreeMap::new(),
            timeout_seconds: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.after.insert(step.into());
        self
    }

    pub fn continue_on_error(mut self, allowed: bool) -> Self {
        self.continue_on_error = allowed;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

impl ArtifactSpec {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}
