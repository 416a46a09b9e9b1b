//! Execution contexts for runs and steps
//!
//! A [`RunScope`] owns everything a single run needs while it executes:
//! - Workspace directory shared by the steps of the run
//! - Temporary area holding per-step scratch directories
//! - Cancellation token checked at step boundaries
//!
//! A [`StepContext`] is acquired for each step and released when dropped,
//! which removes the step's scratch directory on every exit path.

use anyhow::{Context as AnyhowContext, Result};
use kiln_core::domain::pipeline::StepSpec;
use kiln_core::domain::run::Run;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::action::ActionInvocation;

/// Parameter selecting a subdirectory of the workspace to run in
pub const WORKING_DIRECTORY_PARAM: &str = "working-directory";

/// Workspace and cancellation state of one run
///
/// The workspace is removed when the scope is dropped.
pub struct RunScope {
    run_id: Uuid,
    root: TempDir,
    workspace: PathBuf,
    temp: PathBuf,
    cancel: CancellationToken,
}

impl RunScope {
    /// Creates the run directories under `base`
    pub fn create(base: &Path, run_id: Uuid) -> Result<Self> {
        fs::create_dir_all(base)
            .with_context(|| format!("Failed to create workspace base {}", base.display()))?;

        let root = tempfile::Builder::new()
            .prefix(&format!("run-{}-", run_id))
            .tempdir_in(base)
            .context("Failed to create run directory")?;

        let workspace = root.path().join("workspace");
        let temp = root.path().join("tmp");
        fs::create_dir_all(&workspace).context("Failed to create run workspace")?;
        fs::create_dir_all(&temp).context("Failed to create run temp directory")?;

        debug!("Created workspace {} for run {}", workspace.display(), run_id);

        Ok(Self {
            run_id,
            root,
            workspace,
            temp,
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the cancellation token, e.g. with one tracked by a dispatcher
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Directory shared by all steps of the run
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Root directory of the run (workspace and temp area)
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Isolated context for one step
pub struct StepContext {
    pub step_name: String,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    workspace: PathBuf,
    scratch: TempDir,
}

impl StepContext {
    /// Acquires the context of `step` within `scope`
    ///
    /// Environment precedence, lowest first: pipeline environment, step
    /// `env`, `INPUT_<NAME>` for scalar parameters, `KILN_*` run variables.
    pub fn acquire(run: &Run, step: &StepSpec, scope: &RunScope) -> Result<Self> {
        let working_directory = match step.parameters.get(WORKING_DIRECTORY_PARAM) {
            Some(JsonValue::String(dir)) => {
                let relative = Path::new(dir);
                if !is_contained(relative) {
                    anyhow::bail!(
                        "{} '{}' must be a relative path inside the workspace",
                        WORKING_DIRECTORY_PARAM,
                        dir
                    );
                }
                scope.workspace().join(relative)
            }
            Some(other) => anyhow::bail!(
                "{} must be a string, got {}",
                WORKING_DIRECTORY_PARAM,
                other
            ),
            None => scope.workspace().to_path_buf(),
        };

        fs::create_dir_all(&working_directory).with_context(|| {
            format!(
                "Failed to create working directory {}",
                working_directory.display()
            )
        })?;

        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize(&step.name)))
            .tempdir_in(&scope.temp)
            .context("Failed to create step scratch directory")?;

        let mut environment = run.definition.environment.clone();
        environment.extend(step.env.clone());

        for (key, value) in &step.parameters {
            if let Some(value) = scalar_to_string(value) {
                environment.insert(format!("INPUT_{}", env_key(key)), value);
            }
        }

        environment.insert("KILN_RUN_ID".to_string(), run.id.to_string());
        environment.insert("KILN_PIPELINE".to_string(), run.definition.name.clone());
        environment.insert("KILN_STEP".to_string(), step.name.clone());
        environment.insert(
            "KILN_WORKSPACE".to_string(),
            scope.workspace().to_string_lossy().to_string(),
        );
        environment.insert(
            "KILN_TEMP".to_string(),
            scratch.path().to_string_lossy().to_string(),
        );

        Ok(Self {
            step_name: step.name.clone(),
            working_directory,
            environment,
            workspace: scope.workspace().to_path_buf(),
            scratch,
        })
    }

    /// Private directory removed when the context is released
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Builds the owned invocation handed to an action
    pub fn invocation(
        &self,
        run_id: Uuid,
        parameters: &BTreeMap<String, JsonValue>,
    ) -> ActionInvocation {
        ActionInvocation {
            run_id,
            step_name: self.step_name.clone(),
            parameters: parameters.clone(),
            working_directory: self.working_directory.clone(),
            workspace: self.workspace.clone(),
            environment: self.environment.clone(),
            scratch_dir: self.scratch.path().to_path_buf(),
        }
    }
}

impl Drop for StepContext {
    fn drop(&mut self) {
        debug!("Releasing context of step '{}'", self.step_name);
    }
}

/// True for relative paths that cannot escape their base directory
pub(crate) fn is_contained(path: &Path) -> bool {
    let mut depth = 0i32;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
