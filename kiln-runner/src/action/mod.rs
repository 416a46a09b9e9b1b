//! Step actions
//!
//! Every step names an action: an opaque, replaceable capability such as a
//! source checkout, a toolchain install or a compiler invocation. Actions
//! implement [`Action`] and are resolved by name through the
//! [`ActionRegistry`].

pub mod command;
pub mod upload;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiln_core::ConfigError;
use kiln_core::domain::pipeline::PipelineDefinition;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::is_contained;

pub use command::CommandAction;
pub use upload::UploadArtifactAction;

/// Everything an action receives for one step
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub run_id: Uuid,
    pub step_name: String,
    pub parameters: BTreeMap<String, JsonValue>,
    pub working_directory: PathBuf,
    /// Root of the run workspace; output paths are reported relative to it
    pub workspace: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub scratch_dir: PathBuf,
}

impl ActionInvocation {
    /// Returns a string parameter
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(JsonValue::as_str)
    }

    /// Returns a parameter given either as a string or a list of strings
    pub fn string_list_param(&self, key: &str) -> Result<Vec<String>> {
        match self.parameters.get(key) {
            None | Some(JsonValue::Null) => Ok(Vec::new()),
            Some(JsonValue::String(s)) => Ok(s
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(String::from).ok_or_else(|| {
                        anyhow::anyhow!("Parameter '{}' must only contain strings", key)
                    })
                })
                .collect(),
            Some(other) => anyhow::bail!(
                "Parameter '{}' must be a string or a list of strings, got {}",
                key,
                other
            ),
        }
    }
}

/// Whether an action considers its work done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    Failure,
}

/// Result reported by an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub exit_code: i32,
    pub output_paths: Vec<PathBuf>,
}

impl ActionOutcome {
    pub fn success() -> Self {
        Self::success_with_outputs(Vec::new())
    }

    pub fn success_with_outputs(output_paths: Vec<PathBuf>) -> Self {
        Self {
            status: ActionStatus::Success,
            exit_code: 0,
            output_paths,
        }
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            status: ActionStatus::Failure,
            exit_code,
            output_paths: Vec::new(),
        }
    }
}

/// A step capability
///
/// `run` returns `Err` only when the action could not do its work at all
/// (for example the process could not be spawned); a process that ran and
/// failed is an `Ok` outcome with `ActionStatus::Failure`.
#[async_trait]
pub trait Action: Send + Sync {
    /// Name steps use to address this action
    fn name(&self) -> &str;

    async fn run(&self, invocation: ActionInvocation) -> Result<ActionOutcome>;
}

/// Registry of actions available to the engine
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in actions
    pub fn with_builtins(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        registry.register(CommandAction::new(config.default_shell.clone()));
        registry.register(UploadArtifactAction::new());
        registry
    }

    /// Registers an action, replacing any action with the same name
    pub fn register<A: Action + 'static>(&mut self, action: A) {
        self.register_arc(Arc::new(action));
    }

    pub fn register_arc(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered action names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Actions used by `definition` that are not registered, sorted
    pub fn missing(&self, definition: &PipelineDefinition) -> Vec<String> {
        definition
            .steps
            .iter()
            .filter(|step| !self.contains(&step.action))
            .map(|step| step.action.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Rejects a definition that uses unregistered actions
    pub fn check(&self, definition: &PipelineDefinition) -> Result<(), ConfigError> {
        let missing = self.missing(definition);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::UnknownActions(missing))
        }
    }
}

/// Resolves output globs inside `working_directory`
///
/// Returns existing files relative to `workspace`, in pattern order and
/// without duplicates.
pub fn resolve_outputs(
    patterns: &[String],
    working_directory: &Path,
    workspace: &Path,
) -> Result<Vec<PathBuf>> {
    let base = glob::Pattern::escape(&working_directory.to_string_lossy());
    let mut seen = HashSet::new();
    let mut outputs = Vec::new();

    for pattern in patterns {
        if !is_contained(Path::new(pattern)) {
            anyhow::bail!("Output pattern '{}' must stay inside the workspace", pattern);
        }

        let full = format!("{}/{}", base, pattern);
        let entries =
            glob::glob(&full).with_context(|| format!("Invalid output pattern '{}'", pattern))?;

        for entry in entries {
            let path = entry.with_context(|| format!("Failed to read match of '{}'", pattern))?;
            if !path.is_file() {
                continue;
            }
            let relative = path
                .strip_prefix(workspace)
                .map(Path::to_path_buf)
                .unwrap_or(path);
            if seen.insert(relative.clone()) {
                outputs.push(relative);
            }
        }
    }

    Ok(outputs)
}
