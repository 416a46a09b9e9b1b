//! Run service
//!
//! Runs the lifecycle of one run from a trigger request to its final
//! record: plan, execute, record, publish.

use anyhow::{Context, Result};
use dashmap::DashMap;
use kiln_core::build_plan;
use kiln_core::domain::artifact::PublishOutcome;
use kiln_core::domain::pipeline::PipelineDefinition;
use kiln_core::domain::run::{Run, RunRecord, RunStatus};
use kiln_core::domain::trigger::RunRequest;
use kiln_runner::ExecutionEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::publish::ArtifactPublisher;
use crate::repository::RunLedger;

/// Final state of a launched run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub record: RunRecord,

    /// None unless the run succeeded
    pub publish: Option<PublishOutcome>,
}

/// Launches runs and tracks the active ones
pub struct RunService {
    engine: Arc<ExecutionEngine>,
    ledger: Arc<RunLedger>,
    publisher: Arc<ArtifactPublisher>,
    active: Arc<DashMap<Uuid, CancellationToken>>,
}

impl RunService {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        ledger: Arc<RunLedger>,
        publisher: Arc<ArtifactPublisher>,
    ) -> Self {
        Self {
            engine,
            ledger,
            publisher,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    /// Executes a run for `request` and records its outcome
    ///
    /// Step failures end up in the returned record; an error means the run
    /// could not be executed or recorded at all.
    pub async fn launch(
        &self,
        definition: Arc<PipelineDefinition>,
        request: RunRequest,
    ) -> Result<RunOutcome> {
        self.launch_under(definition, request, &CancellationToken::new())
            .await
    }

    /// Like [`RunService::launch`], with the run's cancellation tied to `parent`
    ///
    /// A run launched after `parent` was cancelled is recorded as cancelled
    /// without executing any step.
    pub async fn launch_under(
        &self,
        definition: Arc<PipelineDefinition>,
        request: RunRequest,
        parent: &CancellationToken,
    ) -> Result<RunOutcome> {
        let plan = build_plan(&definition.steps)
            .with_context(|| format!("Failed to plan pipeline '{}'", definition.name))?;

        let mut run = Run::new(definition, &request);
        let token = parent.child_token();
        let _active = ActiveRun::track(&self.active, run.id, token.clone());

        info!(
            "Launching run {} of pipeline '{}' ({:?})",
            run.id, run.definition.name, run.trigger
        );

        let scope = self
            .engine
            .create_scope(run.id)
            .with_context(|| format!("Failed to create workspace for run {}", run.id))?
            .with_cancellation(token);

        self.engine
            .execute(&plan, &mut run, &scope)
            .await
            .context("Run could not be executed")?;

        let record = self
            .ledger
            .record(&run)
            .await
            .with_context(|| format!("Failed to record run {}", run.id))?;

        let publish = if run.status() == RunStatus::Succeeded {
            let outcome = match self.publisher.publish(&run, scope.workspace()).await {
                Ok(artifacts) => PublishOutcome::Published { artifacts },
                Err(e) => {
                    error!("Publishing run {} failed: {}", run.id, e);
                    PublishOutcome::Failed {
                        error: e.to_string(),
                        stored: e.stored_artifacts().to_vec(),
                    }
                }
            };
            if let Err(e) = self.ledger.record_publish(run.id, outcome.clone()).await {
                warn!("Failed to record publish outcome of run {}: {}", run.id, e);
            }
            // The ledger holds the outcome from here on
            self.publisher.forget_run(run.id);
            Some(outcome)
        } else {
            None
        };

        info!("Run {} completed with status {}", run.id, record.status);

        // Dropping the scope removes the run workspace
        drop(scope);

        Ok(RunOutcome { record, publish })
    }

    /// Requests cancellation of an active run
    ///
    /// Returns false if no run with this id is executing.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(token) => {
                info!("Cancelling run {}", run_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active.iter().map(|e| *e.key()).collect()
    }
}

/// Keeps a run in the active set until dropped
struct ActiveRun {
    active: Arc<DashMap<Uuid, CancellationToken>>,
    run_id: Uuid,
}

impl ActiveRun {
    fn track(
        active: &Arc<DashMap<Uuid, CancellationToken>>,
        run_id: Uuid,
        token: CancellationToken,
    ) -> Self {
        active.insert(run_id, token);
        Self {
            active: Arc::clone(active),
            run_id,
        }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}
