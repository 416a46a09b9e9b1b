//! Execution engine
//!
//! Drives a run through its execution plan:
//! - Acquiring an isolated context for each step
//! - Invoking the step's action and recording its result
//! - Halting and skipping the remaining steps after a disallowed failure
//! - Honoring cancellation at step boundaries
//!
//! Step failures never escape the engine; they are recorded on the run.

use anyhow::Result;
use kiln_core::domain::pipeline::StepSpec;
use kiln_core::domain::run::{Run, RunStatus, StepResult, StepStatus};
use kiln_core::{ExecutionPlan, RunStateError, StepExecutionError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{ActionOutcome, ActionRegistry, ActionStatus};
use crate::config::EngineConfig;
use crate::context::{RunScope, StepContext};

/// Exit code recorded for a step that ran out of time
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Executes runs step by step
pub struct ExecutionEngine {
    registry: Arc<ActionRegistry>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<ActionRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates the workspace of a run under the configured base directory
    pub fn create_scope(&self, run_id: Uuid) -> Result<RunScope> {
        RunScope::create(&self.config.workspace_base, run_id)
    }

    /// Executes `plan` for a pending `run`
    ///
    /// Returns the run for chaining; the only error is a run that is not
    /// pending.
    pub async fn execute<'r>(
        &self,
        plan: &ExecutionPlan,
        run: &'r mut Run,
        scope: &RunScope,
    ) -> Result<&'r mut Run, RunStateError> {
        run.transition(RunStatus::Running)?;

        info!(
            "Starting run {} of pipeline '{}' with {} steps",
            run.id,
            run.definition.name,
            plan.len()
        );

        let total = plan.len();
        let mut halted: Option<RunStatus> = None;

        for (idx, step) in plan.steps().iter().enumerate() {
            if halted.is_none() && scope.is_cancelled() {
                info!("Run {} cancelled before step '{}'", run.id, step.name);
                halted = Some(RunStatus::Cancelled);
            }

            if halted.is_some() {
                debug!("Skipping step '{}'", step.name);
                run.step_results.push(StepResult::skipped(&step.name));
                continue;
            }

            info!("Executing step {}/{}: {}", idx + 1, total, step.name);

            let result = self.execute_step(run, step, scope).await;
            let failed = result.status == StepStatus::Failed;

            if failed {
                let reason = result.error.clone().unwrap_or_default();
                if step.continue_on_error {
                    warn!(
                        "Step '{}' failed, continuing (continue_on_error): {}",
                        step.name, reason
                    );
                } else {
                    error!("Step '{}' failed: {}", step.name, reason);
                    halted = Some(RunStatus::Failed);
                }
            } else {
                debug!("Step '{}' completed in {} ms", step.name, result.duration_ms);
            }

            run.step_results.push(result);
        }

        let status = halted.unwrap_or(RunStatus::Succeeded);
        run.transition(status)?;

        info!("Run {} finished with status: {}", run.id, status);

        Ok(run)
    }

    /// Executes a single step and records its result
    async fn execute_step(&self, run: &Run, step: &StepSpec, scope: &RunScope) -> StepResult {
        let started = Instant::now();

        let Some(action) = self.registry.get(&step.action) else {
            return failed_result(
                step,
                started,
                None,
                StepExecutionError::UnknownAction(step.action.clone()),
            );
        };

        // Released on every return path below, including panics and timeouts
        let context = match StepContext::acquire(run, step, scope) {
            Ok(context) => context,
            Err(e) => {
                return failed_result(
                    step,
                    started,
                    None,
                    StepExecutionError::Context(format!("{:#}", e)),
                );
            }
        };

        let invocation = context.invocation(run.id, &step.parameters);
        let timeout_secs = step
            .timeout_seconds
            .unwrap_or_else(|| self.config.step_timeout.as_secs());

        let mut handle = tokio::spawn(async move { action.run(invocation).await });

        let joined =
            match tokio::time::timeout(Duration::from_secs(timeout_secs), &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return failed_result(
                        step,
                        started,
                        Some(TIMEOUT_EXIT_CODE),
                        StepExecutionError::TimedOut(timeout_secs),
                    );
                }
            };

        let outcome: ActionOutcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                return failed_result(
                    step,
                    started,
                    None,
                    StepExecutionError::ActionFailed(format!("{:#}", e)),
                );
            }
            Err(e) => {
                return failed_result(step, started, None, join_failure(e));
            }
        };

        drop(context);

        let captured_output_paths = normalize_outputs(outcome.output_paths, scope.workspace());
        let duration_ms = elapsed_ms(started);

        match outcome.status {
            ActionStatus::Success => StepResult {
                step_name: step.name.clone(),
                status: StepStatus::Succeeded,
                exit_code: Some(outcome.exit_code),
                duration_ms,
                captured_output_paths,
                error: None,
            },
            ActionStatus::Failure => {
                let error = if outcome.exit_code != 0 {
                    StepExecutionError::NonZeroExit(outcome.exit_code)
                } else {
                    StepExecutionError::ActionFailed("action reported failure".to_string())
                };
                StepResult {
                    step_name: step.name.clone(),
                    status: StepStatus::Failed,
                    exit_code: Some(outcome.exit_code),
                    duration_ms,
                    captured_output_paths,
                    error: Some(error.to_string()),
                }
            }
        }
    }
}

fn failed_result(
    step: &StepSpec,
    started: Instant,
    exit_code: Option<i32>,
    error: StepExecutionError,
) -> StepResult {
    StepResult {
        step_name: step.name.clone(),
        status: StepStatus::Failed,
        exit_code,
        duration_ms: elapsed_ms(started),
        captured_output_paths: Vec::new(),
        error: Some(error.to_string()),
    }
}

fn join_failure(err: JoinError) -> StepExecutionError {
    match err.try_into_panic() {
        Ok(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            StepExecutionError::Panicked(message)
        }
        Err(err) => StepExecutionError::ActionFailed(err.to_string()),
    }
}

/// Makes output paths relative to the workspace and drops duplicates
fn normalize_outputs(paths: Vec<PathBuf>, workspace: &Path) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .map(|path| match path.strip_prefix(workspace) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => path,
        })
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionInvocation};
    use async_trait::async_trait;
    use chrono::Utc;
    use kiln_core::build_plan;
    use kiln_core::domain::pipeline::PipelineDefinition;
    use kiln_core::domain::trigger::{RunRequest, RunTrigger};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Succeeds unless an outcome is scripted for the step
    struct ScriptedAction {
        name: &'static str,
        outcomes: HashMap<String, ActionOutcome>,
        calls: Arc<Mutex<Vec<ActionInvocation>>>,
    }

    impl ScriptedAction {
        fn new(name: &'static str, calls: Arc<Mutex<Vec<ActionInvocation>>>) -> Self {
            Self {
                name,
                outcomes: HashMap::new(),
                calls,
            }
        }

        fn with_outcome(mut self, step: &str, outcome: ActionOutcome) -> Self {
            self.outcomes.insert(step.to_string(), outcome);
            self
        }
    }

    #[async_trait]
    impl Action for ScriptedAction {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, invocation: ActionInvocation) -> Result<ActionOutcome> {
            let outcome = self
                .outcomes
                .get(&invocation.step_name)
                .cloned()
                .unwrap_or_else(ActionOutcome::success);
            self.calls.lock().unwrap().push(invocation);
            Ok(outcome)
        }
    }

    struct PanickingAction {
        scratch: Arc<Mutex<Option<PathBuf>>>,
    }

    #[async_trait]
    impl Action for PanickingAction {
        fn name(&self) -> &str {
            "explode"
        }

        async fn run(&self, invocation: ActionInvocation) -> Result<ActionOutcome> {
            *self.scratch.lock().unwrap() = Some(invocation.scratch_dir.clone());
            panic!("toolchain installer crashed");
        }
    }

    struct SleepingAction;

    #[async_trait]
    impl Action for SleepingAction {
        fn name(&self) -> &str {
            "sleep"
        }

        async fn run(&self, _invocation: ActionInvocation) -> Result<ActionOutcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ActionOutcome::success())
        }
    }

    /// Requests cancellation of the run while its step is in flight
    struct CancellingAction {
        token: CancellationToken,
    }

    #[async_trait]
    impl Action for CancellingAction {
        fn name(&self) -> &str {
            "cancel"
        }

        async fn run(&self, _invocation: ActionInvocation) -> Result<ActionOutcome> {
            self.token.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(ActionOutcome::success())
        }
    }

    struct Fixture {
        _base: TempDir,
        engine: ExecutionEngine,
        run: Run,
        plan: ExecutionPlan,
        scope: RunScope,
    }

    fn fixture(registry: ActionRegistry, steps: Vec<StepSpec>) -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(base.path().to_path_buf());
        let engine = ExecutionEngine::new(Arc::new(registry), config);

        let definition = Arc::new(PipelineDefinition {
            id: Uuid::new_v4(),
            name: "release".to_string(),
            triggers: vec![],
            steps,
            environment: BTreeMap::from([("CI".to_string(), "true".to_string())]),
            artifacts: vec![],
        });
        let plan = build_plan(&definition.steps).unwrap();
        let request = RunRequest {
            definition_id: definition.id,
            trigger: RunTrigger::Manual {
                requested_at: Utc::now(),
            },
            requested_at: Utc::now(),
        };
        let run = Run::new(definition, &request);
        let scope = engine.create_scope(run.id).unwrap();

        Fixture {
            _base: base,
            engine,
            run,
            plan,
            scope,
        }
    }

    fn statuses(run: &Run) -> Vec<StepStatus> {
        run.step_results.iter().map(|r| r.status).collect()
    }

    fn release_steps() -> Vec<StepSpec> {
        vec![
            StepSpec::new("checkout", "fake"),
            StepSpec::new("build", "fake"),
            StepSpec::new("upload", "fake"),
        ]
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::new();
        registry.register(ScriptedAction::new("fake", calls.clone()).with_outcome(
            "upload",
            ActionOutcome::success_with_outputs(vec![PathBuf::from("out/app.exe")]),
        ));

        let mut f = fixture(registry, release_steps());
        let run = f.engine.execute(&f.plan, &mut f.run, &f.scope).await.unwrap();

        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(
            statuses(run),
            vec![StepStatus::Succeeded; 3]
        );
        assert_eq!(
            run.step_results[2].captured_output_paths,
            vec![PathBuf::from("out/app.exe")]
        );
        assert_eq!(run.step_results[0].exit_code, Some(0));

        let order: Vec<String> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.step_name.clone())
            .collect();
        assert_eq!(order, vec!["checkout", "build", "upload"]);
    }

    #[tokio::test]
    async fn test_failure_halts_and_skips_remaining_steps() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::new();
        registry.register(
            ScriptedAction::new("fake", calls.clone())
                .with_outcome("build", ActionOutcome::failure(1)),
        );

        let mut f = fixture(registry, release_steps());
        let run = f.engine.execute(&f.plan, &mut f.run, &f.scope).await.unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(
            statuses(run),
            vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::Skipped]
        );
        assert_eq!(run.step_results[1].exit_code, Some(1));
        assert_eq!(
            run.step_results[1].error.as_deref(),
            Some("Action exited with code 1")
        );
        assert_eq!(run.step_results[2].exit_code, None);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_next_step() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::new();
        registry.register(
            ScriptedAction::new("fake", calls.clone())
                .with_outcome("build", ActionOutcome::failure(2)),
        );

        let steps = vec![
            StepSpec::new("checkout", "fake"),
            StepSpec::new("build", "fake").continue_on_error(true),
            StepSpec::new("upload", "fake"),
        ];
        let mut f = fixture(registry, steps);
        let run = f.engine.execute(&f.plan, &mut f.run, &f.scope).await.unwrap();

        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(
            statuses(run),
            vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::Succeeded]
        );
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_action_fails_step() {
        let mut f = fixture(
            ActionRegistry::new(),
            vec![StepSpec::new("checkout", "checkout")],
        );
        let run = f.engine.execute(&f.plan, &mut f.run, &f.scope).await.unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(
            run.step_results[0].error.as_deref(),
            Some("Action 'checkout' is not registered")
        );
    }

    #[tokio::test]
    async fn test_panicking_action_fails_step_and_releases_context() {
        let scratch = Arc::new(Mutex::new(None));
        let mut registry = ActionRegistry::new();
        registry.register(PanickingAction {
            scratch: scratch.clone(),
        });

        let mut f = fixture(registry, vec![StepSpec::new("toolchain", "explode")]);
        let run = f.engine.execute(&f.plan, &mut f.run, &f.scope).await.unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        let error = run.step_results[0].error.clone().unwrap();
        assert!(error.contains("toolchain installer crashed"), "{}", error);

        let scratch = scratch.lock().unwrap().clone().unwrap();
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let mut registry = ActionRegistry::new();
        registry.register(SleepingAction);

        let mut f = fixture(
            registry,
            vec![StepSpec::new("build", "sleep").with_timeout(1)],
        );
        let run = f.engine.execute(&f.plan, &mut f.run, &f.scope).await.unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.step_results[0].exit_code, Some(TIMEOUT_EXIT_CODE));
        assert_eq!(
            run.step_results[0].error.as_deref(),
            Some("Step timed out after 1 seconds")
        );
    }

    #[tokio::test]
    async fn test_cancellation_honored_at_step_boundary() {
        let token = CancellationToken::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::new();
        registry.register(CancellingAction {
            token: token.clone(),
        });
        registry.register(ScriptedAction::new("fake", calls.clone()));

        let steps = vec![
            StepSpec::new("checkout", "cancel"),
            StepSpec::new("build", "fake"),
            StepSpec::new("upload", "fake"),
        ];
        let mut f = fixture(registry, steps);
        let scope = f.engine.create_scope(f.run.id).unwrap().with_cancellation(token);
        let run = f.engine.execute(&f.plan, &mut f.run, &scope).await.unwrap();

        assert_eq!(run.status(), RunStatus::Cancelled);
        assert_eq!(
            statuses(run),
            vec![StepStatus::Succeeded, StepStatus::Skipped, StepStatus::Skipped]
        );
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_receives_isolated_environment() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::new();
        registry.register(ScriptedAction::new("fake", calls.clone()));

        let steps = vec![
            StepSpec::new("toolchain", "fake")
                .with_env("RUSTUP_TOOLCHAIN", "stable")
                .with_parameter("components", serde_json::json!("clippy")),
            StepSpec::new("build", "fake"),
        ];
        let mut f = fixture(registry, steps);
        f.engine.execute(&f.plan, &mut f.run, &f.scope).await.unwrap();

        let calls = calls.lock().unwrap();
        let toolchain = &calls[0].environment;
        let build = &calls[1].environment;

        assert_eq!(toolchain.get("CI").map(String::as_str), Some("true"));
        assert_eq!(
            toolchain.get("RUSTUP_TOOLCHAIN").map(String::as_str),
            Some("stable")
        );
        assert_eq!(
            toolchain.get("INPUT_COMPONENTS").map(String::as_str),
            Some("clippy")
        );
        assert_eq!(build.get("CI").map(String::as_str), Some("true"));
        assert!(!build.contains_key("RUSTUP_TOOLCHAIN"));
        assert!(!build.contains_key("INPUT_COMPONENTS"));
        assert_ne!(calls[0].scratch_dir, calls[1].scratch_dir);
        assert_eq!(calls[0].workspace, calls[1].workspace);
    }

    #[tokio::test]
    async fn test_execute_rejects_run_that_already_started() {
        let mut registry = ActionRegistry::new();
        registry.register(ScriptedAction::new("fake", Arc::new(Mutex::new(Vec::new()))));

        let mut f = fixture(registry, release_steps());
        f.engine.execute(&f.plan, &mut f.run, &f.scope).await.unwrap();

        let err = f
            .engine
            .execute(&f.plan, &mut f.run, &f.scope)
            .await
            .unwrap_err();
        assert_eq!(err.from, RunStatus::Succeeded);
    }

    #[test]
    fn test_normalize_outputs() {
        let workspace = Path::new("/work/run");
        let outputs = normalize_outputs(
            vec![
                PathBuf::from("/work/run/out/app.exe"),
                PathBuf::from("out/app.exe"),
                PathBuf::from("/elsewhere/log.txt"),
            ],
            workspace,
        );
        assert_eq!(
            outputs,
            vec![
                PathBuf::from("out/app.exe"),
                PathBuf::from("/elsewhere/log.txt")
            ]
        );
    }
}
