//! Artifact publisher
//!
//! Turns the outputs captured by a succeeded run into named artifacts and
//! hands them to the storage collaborator. Only succeeded runs are ever
//! published. Publishing is idempotent per (run id, artifact name).

use dashmap::DashMap;
use glob_match::glob_match;
use kiln_core::PublishError;
use kiln_core::domain::artifact::{Artifact, StorageHandle};
use kiln_core::domain::pipeline::ArtifactSpec;
use kiln_core::domain::run::{Run, RunStatus};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::storage::ArtifactStore;

/// Publisher settings
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Skip artifacts whose pattern matched nothing instead of failing
    pub allow_empty: bool,

    /// Store attempts per artifact, including the first one
    pub max_attempts: u32,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            allow_empty: false,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Publishes the artifacts of succeeded runs
pub struct ArtifactPublisher {
    store: Arc<dyn ArtifactStore>,
    config: PublishConfig,
    published: DashMap<(Uuid, String), Arc<OnceCell<Artifact>>>,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn ArtifactStore>, config: PublishConfig) -> Self {
        Self {
            store,
            config,
            published: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    /// Publishes every artifact declared by the run's definition
    ///
    /// `workspace_root` is the directory the captured output paths are
    /// relative to. In strict mode an artifact without matching outputs
    /// fails the publish before anything is stored. Concurrent calls for
    /// the same run share one upload per artifact.
    pub async fn publish(
        &self,
        run: &Run,
        workspace_root: &Path,
    ) -> Result<Vec<Artifact>, PublishError> {
        if run.status() != RunStatus::Succeeded {
            return Err(PublishError::RunNotSucceeded {
                run_id: run.id,
                status: run.status(),
            });
        }

        let mut pending: Vec<(&ArtifactSpec, Vec<PathBuf>)> = Vec::new();
        for spec in &run.definition.artifacts {
            let paths = matching_outputs(run, &spec.path);
            if paths.is_empty() {
                if self.config.allow_empty {
                    warn!(
                        "Artifact '{}' of run {} matched no files for '{}', skipping",
                        spec.name, run.id, spec.path
                    );
                    continue;
                }
                return Err(PublishError::EmptyArtifact {
                    name: spec.name.clone(),
                    pattern: spec.path.clone(),
                });
            }
            pending.push((spec, paths));
        }

        let mut artifacts = Vec::with_capacity(pending.len());
        for (spec, paths) in pending {
            // Clone the cell out so the shard lock is not held across the upload
            let cell = self
                .published
                .entry((run.id, spec.name.clone()))
                .or_default()
                .clone();

            if let Some(existing) = cell.get() {
                debug!(
                    "Artifact '{}' of run {} already published",
                    spec.name, run.id
                );
                artifacts.push(existing.clone());
                continue;
            }

            let published = cell
                .get_or_try_init(|| self.store_artifact(run.id, spec, workspace_root, paths))
                .await;

            match published {
                Ok(artifact) => artifacts.push(artifact.clone()),
                Err(mut e) => {
                    if let PublishError::Storage { stored, .. } = &mut e {
                        *stored = artifacts;
                    }
                    return Err(e);
                }
            }
        }

        Ok(artifacts)
    }

    /// Drops the cached artifacts of a run once its outcome is recorded
    pub fn forget_run(&self, run_id: Uuid) {
        self.published.retain(|(id, _), _| *id != run_id);
    }

    async fn store_artifact(
        &self,
        run_id: Uuid,
        spec: &ArtifactSpec,
        workspace_root: &Path,
        paths: Vec<PathBuf>,
    ) -> Result<Artifact, PublishError> {
        let storage_handle = self
            .store_with_retry(&spec.name, workspace_root, &paths)
            .await?;

        info!(
            "Published artifact '{}' of run {} ({} file(s)) as {}",
            spec.name,
            run_id,
            paths.len(),
            storage_handle
        );

        Ok(Artifact {
            name: spec.name.clone(),
            source_run_id: run_id,
            paths,
            storage_handle,
        })
    }

    /// Stores one artifact, retrying with exponential backoff
    async fn store_with_retry(
        &self,
        name: &str,
        root: &Path,
        paths: &[PathBuf],
    ) -> Result<StorageHandle, PublishError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut delay = self.config.initial_backoff;

        loop {
            attempt += 1;

            match self.store.store(name, root, paths).await {
                Ok(handle) => {
                    if attempt > 1 {
                        info!(
                            "Stored artifact '{}' after {} attempt(s)",
                            name, attempt
                        );
                    }
                    return Ok(handle);
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        error!(
                            "Failed to store artifact '{}' after {} attempts",
                            name, attempt
                        );
                        return Err(PublishError::Storage {
                            name: name.to_string(),
                            attempts: attempt,
                            message: e.to_string(),
                            stored: Vec::new(),
                        });
                    }

                    warn!(
                        "Failed to store artifact '{}' (attempt {}/{}): {}",
                        name, attempt, max_attempts, e
                    );
                    warn!("Retrying in {} ms...", delay.as_millis());

                    tokio::time::sleep(delay).await;

                    // Exponential backoff with cap
                    delay = (delay * 2).min(self.config.max_backoff);
                }
            }
        }
    }
}

/// Captured outputs of all steps matching `pattern`, in step order
fn matching_outputs(run: &Run, pattern: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    run.step_results
        .iter()
        .flat_map(|result| result.captured_output_paths.iter())
        .filter(|path| glob_match(pattern, &path.to_string_lossy()))
        .filter(|path| seen.insert((*path).clone()))
        .cloned()
        .collect()
}
