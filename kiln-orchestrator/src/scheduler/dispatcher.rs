//! Run dispatcher
//!
//! Evaluates the triggers of every registered definition on a fixed tick
//! and on manual dispatch events, and launches the resulting runs. Each run
//! executes on its own task; the number of runs executing at once is
//! bounded by a semaphore, and the concurrency policy decides whether runs
//! of one definition may overlap.

use anyhow::Result;
use chrono::{DateTime, Utc};
use kiln_core::domain::pipeline::PipelineDefinition;
use kiln_core::domain::trigger::{ManualDispatch, RunRequest};
use kiln_core::{ConfigError, PlanError, build_plan};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConcurrencyPolicy;
use crate::service::{RunOutcome, RunService};
use crate::trigger::{TriggerEvaluator, TriggerState};

/// A definition could not be registered
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Pipeline {0} is already registered")]
    Duplicate(Uuid),
}

struct Registered {
    evaluator: TriggerEvaluator,
    serial: Arc<Mutex<()>>,
}

/// Dispatches runs of registered pipeline definitions
pub struct Dispatcher {
    service: Arc<RunService>,
    definitions: HashMap<Uuid, Registered>,
    semaphore: Arc<Semaphore>,
    policy: ConcurrencyPolicy,
    tick_interval: Duration,
    manual_tx: mpsc::Sender<ManualDispatch>,
    manual_rx: mpsc::Receiver<ManualDispatch>,
    tasks: JoinSet<()>,
    /// Parent of every run's cancellation token, including queued runs
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        service: Arc<RunService>,
        max_parallel_runs: usize,
        policy: ConcurrencyPolicy,
        tick_interval: Duration,
    ) -> Self {
        let (manual_tx, manual_rx) = mpsc::channel(64);
        Self {
            service,
            definitions: HashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_parallel_runs.max(1))),
            policy,
            tick_interval,
            manual_tx,
            manual_rx,
            tasks: JoinSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Sender for manual dispatch events consumed by [`Dispatcher::run`]
    pub fn manual_sender(&self) -> mpsc::Sender<ManualDispatch> {
        self.manual_tx.clone()
    }

    /// Validates, plans and registers a definition
    ///
    /// Trigger state resumes from the ledger's last successful run.
    pub fn register(
        &mut self,
        definition: PipelineDefinition,
        now: DateTime<Utc>,
    ) -> Result<Uuid, RegistrationError> {
        definition.validate()?;
        let plan = build_plan(&definition.steps)?;
        self.service.engine().registry().check(&definition)?;

        if self.definitions.contains_key(&definition.id) {
            return Err(RegistrationError::Duplicate(definition.id));
        }

        let last_successful = self.service.ledger().last_successful(definition.id);
        let state = TriggerState::resume(last_successful.as_ref(), now);

        info!(
            "Registered pipeline '{}' ({}) with {} trigger(s), plan: {}",
            definition.name,
            definition.id,
            definition.triggers.len(),
            plan.step_names().join(" -> ")
        );

        let id = definition.id;
        self.definitions.insert(
            id,
            Registered {
                evaluator: TriggerEvaluator::new(Arc::new(definition), state),
                serial: Arc::new(Mutex::new(())),
            },
        );
        Ok(id)
    }

    /// Registered definitions
    pub fn definitions(&self) -> Vec<Arc<PipelineDefinition>> {
        self.definitions
            .values()
            .map(|r| Arc::clone(r.evaluator.definition()))
            .collect()
    }

    /// Evaluates every definition at `now` and launches the resulting runs
    ///
    /// A manual event is only offered to the definition it names.
    pub fn tick(&mut self, now: DateTime<Utc>, manual: Option<&ManualDispatch>) -> usize {
        if let Some(event) = manual.filter(|e| !self.definitions.contains_key(&e.definition_id)) {
            warn!(
                "Manual dispatch for unknown pipeline {}, ignoring",
                event.definition_id
            );
        }

        let mut requests = Vec::new();
        for (id, registered) in self.definitions.iter_mut() {
            let event = manual.filter(|e| e.definition_id == *id);
            if let Some(request) = registered.evaluator.evaluate(now, event) {
                requests.push((
                    Arc::clone(registered.evaluator.definition()),
                    Arc::clone(&registered.serial),
                    request,
                ));
            }
        }

        let launched = requests.len();
        for (definition, serial, request) in requests {
            self.spawn_run(definition, serial, request);
        }
        launched
    }

    /// Requests cancellation of an active run
    pub fn cancel(&self, run_id: Uuid) -> bool {
        self.service.cancel(run_id)
    }

    /// Cancels every launched run, including runs still waiting to start
    ///
    /// Waiting runs are recorded as cancelled once they get their turn.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Waits for every launched run to finish
    pub async fn drain(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("Run task panicked: {}", e);
            }
        }
    }

    /// Runs the dispatch loop until `shutdown` is cancelled
    ///
    /// On shutdown every launched run is cancelled and awaited, so each of
    /// them is still recorded.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting dispatcher ({} pipeline(s), tick: {:?}, policy: {:?})",
            self.definitions.len(),
            self.tick_interval,
            self.policy
        );

        let mut interval = time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, cancelling active runs");
                    break;
                }
                _ = interval.tick() => {
                    debug!("Evaluating triggers");
                    let launched = self.tick(Utc::now(), None);
                    if launched > 0 {
                        info!("Launched {} run(s) this tick", launched);
                    }
                }
                Some(event) = self.manual_rx.recv() => {
                    info!("Manual dispatch requested for pipeline {}", event.definition_id);
                    self.tick(Utc::now(), Some(&event));
                }
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = result {
                        warn!("Run task panicked: {}", e);
                    }
                }
            }
        }

        self.cancel_all();
        self.drain().await;

        info!("Dispatcher stopped");
        Ok(())
    }

    fn spawn_run(
        &mut self,
        definition: Arc<PipelineDefinition>,
        serial: Arc<Mutex<()>>,
        request: RunRequest,
    ) {
        let service = Arc::clone(&self.service);
        let semaphore = Arc::clone(&self.semaphore);
        let policy = self.policy;
        let shutdown = self.shutdown.clone();

        if semaphore.available_permits() == 0 {
            debug!(
                "Max parallel runs reached, run of '{}' is queued",
                definition.name
            );
        }

        self.tasks.spawn(async move {
            let _serial = match policy {
                ConcurrencyPolicy::SerializePerDefinition => Some(serial.lock_owned().await),
                ConcurrencyPolicy::Parallel => None,
            };

            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Run of '{}' dropped: {}", definition.name, e);
                    return;
                }
            };

            let name = definition.name.clone();
            match service.launch_under(definition, request, &shutdown).await {
                Ok(RunOutcome { record, .. }) => {
                    debug!("Run {} of '{}' finished: {}", record.run_id, name, record.status);
                }
                Err(e) => {
                    error!("Failed to execute run of '{}': {:#}", name, e);
                }
            }
            // Permit and serialization guard are released when dropped
        });
    }
}
