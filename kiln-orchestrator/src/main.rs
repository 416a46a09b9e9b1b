//! Kiln Orchestrator
//!
//! Reference host for the orchestration engine.
//!
//! Loads pipeline definitions from JSON files, evaluates their triggers on a
//! fixed tick, and executes the resulting runs locally. `SIGUSR1` requests a
//! manual dispatch of every pipeline that accepts one; `Ctrl-C` cancels every
//! launched run at its next step boundary and exits once they are recorded.

use anyhow::{Context, Result};
use chrono::Utc;
use kiln_core::domain::pipeline::PipelineDefinition;
use kiln_core::domain::trigger::ManualDispatch;
use kiln_orchestrator::{
    ArtifactPublisher, Dispatcher, LocalArtifactStore, OrchestratorConfig, RunLedger, RunService,
};
use kiln_runner::{ActionRegistry, ExecutionEngine};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_orchestrator=info,kiln_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Orchestrator");

    let config = load_config()?;
    info!(
        "Loaded configuration: {} pipeline file(s), artifacts in {}",
        config.pipeline_files.len(),
        config.artifact_dir.display()
    );

    let registry = ActionRegistry::with_builtins(&config.engine);
    info!("Available actions: {}", registry.names().join(", "));
    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(registry),
        config.engine.clone(),
    ));

    let ledger = match &config.ledger_dir {
        Some(dir) => RunLedger::open(dir)
            .with_context(|| format!("Failed to open ledger at {}", dir.display()))?,
        None => {
            warn!("LEDGER_DIR not set, run records are kept in memory only");
            RunLedger::in_memory()
        }
    };

    let store = Arc::new(LocalArtifactStore::new(config.artifact_dir.clone()));
    let publisher = Arc::new(ArtifactPublisher::new(store, config.publish.clone()));
    let service = Arc::new(RunService::new(engine, Arc::new(ledger), publisher));

    let mut dispatcher = Dispatcher::new(
        service,
        config.max_parallel_runs,
        config.concurrency_policy,
        config.tick_interval,
    );

    let now = Utc::now();
    for path in &config.pipeline_files {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        let definition = PipelineDefinition::from_json(&source)
            .with_context(|| format!("Invalid pipeline file {}", path.display()))?;
        dispatcher
            .register(definition, now)
            .with_context(|| format!("Failed to register pipeline from {}", path.display()))?;
    }

    let dispatchable: Vec<Uuid> = dispatcher
        .definitions()
        .iter()
        .filter(|d| d.is_manually_dispatchable())
        .map(|d| d.id)
        .collect();
    spawn_manual_dispatch_listener(dispatcher.manual_sender(), dispatchable);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C");
        signal_token.cancel();
    });

    info!("Orchestrator initialized successfully");

    if let Err(e) = dispatcher.run(shutdown).await {
        error!("Dispatcher error: {:#}", e);
        return Err(e);
    }

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<OrchestratorConfig> {
    let config = OrchestratorConfig::from_env()?;
    config.validate()?;
    Ok(config)
}

/// Maps `SIGUSR1` to a manual dispatch of every dispatchable pipeline
#[cfg(unix)]
fn spawn_manual_dispatch_listener(sender: mpsc::Sender<ManualDispatch>, pipelines: Vec<Uuid>) {
    use tokio::signal::unix::{SignalKind, signal};

    if pipelines.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let mut signals = match signal(SignalKind::user_defined1()) {
            Ok(signals) => signals,
            Err(e) => {
                error!("Failed to listen for SIGUSR1: {}", e);
                return;
            }
        };

        while signals.recv().await.is_some() {
            info!("Received SIGUSR1, dispatching {} pipeline(s)", pipelines.len());
            for definition_id in &pipelines {
                let event = ManualDispatch {
                    definition_id: *definition_id,
                    requested_at: Utc::now(),
                };
                if sender.send(event).await.is_err() {
                    return;
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_manual_dispatch_listener(_sender: mpsc::Sender<ManualDispatch>, pipelines: Vec<Uuid>) {
    if !pipelines.is_empty() {
        warn!("Manual dispatch via SIGUSR1 is only available on Unix");
    }
}
