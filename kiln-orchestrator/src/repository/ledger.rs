//! Run ledger
//!
//! Append-only record of terminal runs and of their publishing outcomes.
//! Records are keyed by run id in sharded maps, so writers to different
//! runs never contend on one global lock, while the entry lock serializes
//! writers to the same run.
//!
//! When opened on a directory, each record is also written as JSON:
//! - `runs/<run id>.json`
//! - `publishes/<run id>.json`

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kiln_core::domain::artifact::{PublishOutcome, PublishRecord};
use kiln_core::domain::run::{Run, RunRecord, RunStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const RUNS_DIR: &str = "runs";
const PUBLISHES_DIR: &str = "publishes";

/// Ledger error type
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Run {0} has not reached a terminal status")]
    NotTerminal(Uuid),

    #[error("Run {0} is already recorded")]
    AlreadyRecorded(Uuid),

    #[error("Run {0} is not recorded")]
    UnknownRun(Uuid),

    #[error("Publish outcome of run {0} is already recorded")]
    PublishAlreadyRecorded(Uuid),

    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable store of run outcomes
#[derive(Debug, Default)]
pub struct RunLedger {
    runs: DashMap<Uuid, RunRecord>,
    publishes: DashMap<Uuid, PublishRecord>,
    dir: Option<PathBuf>,
}

impl RunLedger {
    /// Creates a ledger kept in memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a ledger persisted under `dir`, loading existing records
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(RUNS_DIR))?;
        fs::create_dir_all(dir.join(PUBLISHES_DIR))?;

        let runs = DashMap::new();
        for record in load_all::<RunRecord>(&dir.join(RUNS_DIR))? {
            runs.insert(record.run_id, record);
        }

        let publishes = DashMap::new();
        for record in load_all::<PublishRecord>(&dir.join(PUBLISHES_DIR))? {
            publishes.insert(record.run_id, record);
        }

        info!(
            "Opened run ledger at {} ({} runs, {} publish outcomes)",
            dir.display(),
            runs.len(),
            publishes.len()
        );

        Ok(Self {
            runs,
            publishes,
            dir: Some(dir),
        })
    }

    /// Records a terminal run
    ///
    /// A run is recorded at most once; the record is immutable afterwards.
    /// The entry is claimed first and written to disk off the runtime
    /// threads; a failed write releases the claim again.
    pub async fn record(&self, run: &Run) -> Result<RunRecord, LedgerError> {
        let record = run.to_record().ok_or(LedgerError::NotTerminal(run.id))?;

        match self.runs.entry(run.id) {
            Entry::Occupied(_) => return Err(LedgerError::AlreadyRecorded(run.id)),
            Entry::Vacant(entry) => {
                entry.insert(record.clone());
            }
        }

        if let Some(dir) = &self.dir {
            if let Err(e) = persist(dir.join(RUNS_DIR), run.id, record.clone()).await {
                self.runs.remove(&run.id);
                return Err(e);
            }
        }

        debug!("Recorded run {} as {}", run.id, record.status);
        Ok(record)
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunRecord> {
        self.runs.get(&run_id).map(|r| r.value().clone())
    }

    /// Most recently finished successful run of a definition
    pub fn last_successful(&self, definition_id: Uuid) -> Option<RunRecord> {
        self.runs
            .iter()
            .filter(|r| r.definition_id == definition_id && r.status == RunStatus::Succeeded)
            .max_by_key(|r| r.finished_at)
            .map(|r| r.value().clone())
    }

    /// All recorded runs of a definition, oldest first
    pub fn runs_for(&self, definition_id: Uuid) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| r.definition_id == definition_id)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    /// Records the publishing outcome of a recorded run, at most once
    pub async fn record_publish(
        &self,
        run_id: Uuid,
        outcome: PublishOutcome,
    ) -> Result<PublishRecord, LedgerError> {
        if !self.runs.contains_key(&run_id) {
            return Err(LedgerError::UnknownRun(run_id));
        }

        let record = PublishRecord {
            run_id,
            recorded_at: Utc::now(),
            outcome,
        };

        match self.publishes.entry(run_id) {
            Entry::Occupied(_) => return Err(LedgerError::PublishAlreadyRecorded(run_id)),
            Entry::Vacant(entry) => {
                entry.insert(record.clone());
            }
        }

        if let Some(dir) = &self.dir {
            if let Err(e) = persist(dir.join(PUBLISHES_DIR), run_id, record.clone()).await {
                self.publishes.remove(&run_id);
                return Err(e);
            }
        }

        Ok(record)
    }

    pub fn publish_outcome(&self, run_id: Uuid) -> Option<PublishRecord> {
        self.publishes.get(&run_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

async fn persist<T>(dir: PathBuf, run_id: Uuid, value: T) -> Result<(), LedgerError>
where
    T: Serialize + Send + 'static,
{
    tokio::task::spawn_blocking(move || write_json(&dir, run_id, &value))
        .await
        .map_err(|e| LedgerError::Io(std::io::Error::other(e)))?
}

/// Writes through a temporary file so a crash never leaves a partial record
fn write_json<T: Serialize>(dir: &Path, run_id: Uuid, value: &T) -> Result<(), LedgerError> {
    let path = dir.join(format!("{}.json", run_id));
    let tmp = dir.join(format!("{}.json.tmp", run_id));
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

fn load_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, LedgerError> {
    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = fs::read(&path)?;
        records.push(serde_json::from_slice(&bytes)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kiln_core::domain::artifact::{Artifact, StorageHandle};
    use kiln_core::domain::pipeline::{PipelineDefinition, StepSpec};
    use kiln_core::domain::run::{StepResult, StepStatus};
    use kiln_core::domain::trigger::{RunRequest, RunTrigger};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn definition() -> Arc<PipelineDefinition> {
        Arc::new(PipelineDefinition {
            id: Uuid::new_v4(),
            name: "release".to_string(),
            triggers: vec![],
            steps: vec![StepSpec::new("build", "run-command")],
            environment: BTreeMap::new(),
            artifacts: vec![],
        })
    }

    fn finished_run(definition: &Arc<PipelineDefinition>, status: RunStatus) -> Run {
        let request = RunRequest {
            definition_id: definition.id,
            trigger: RunTrigger::Manual {
                requested_at: Utc::now(),
            },
            requested_at: Utc::now(),
        };
        let mut run = Run::new(definition.clone(), &request);
        run.transition(RunStatus::Running).unwrap();
        run.step_results.push(StepResult {
            step_name: "build".to_string(),
            status: if status == RunStatus::Succeeded {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            },
            exit_code: Some(0),
            duration_ms: 12,
            captured_output_paths: vec![PathBuf::from("out/app.exe")],
            error: None,
        });
        run.transition(status).unwrap();
        run
    }

    #[tokio::test]
    async fn test_record_requires_terminal_run() {
        let ledger = RunLedger::in_memory();
        let def = definition();
        let request = RunRequest {
            definition_id: def.id,
            trigger: RunTrigger::Manual {
                requested_at: Utc::now(),
            },
            requested_at: Utc::now(),
        };
        let run = Run::new(def, &request);

        assert!(matches!(
            ledger.record(&run).await,
            Err(LedgerError::NotTerminal(id)) if id == run.id
        ));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_record_is_immutable() {
        let ledger = RunLedger::in_memory();
        let def = definition();
        let run = finished_run(&def, RunStatus::Failed);

        let record = ledger.record(&run).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(matches!(
            ledger.record(&run).await,
            Err(LedgerError::AlreadyRecorded(_))
        ));
        assert_eq!(ledger.get(run.id), Some(record));
    }

    #[tokio::test]
    async fn test_last_successful_and_runs_for() {
        let ledger = RunLedger::in_memory();
        let def = definition();

        let mut older = finished_run(&def, RunStatus::Succeeded);
        older.started_at -= Duration::hours(2);
        older.finished_at = older.finished_at.map(|t| t - Duration::hours(2));
        let failed = finished_run(&def, RunStatus::Failed);
        let newer = finished_run(&def, RunStatus::Succeeded);
        let other = finished_run(&definition(), RunStatus::Succeeded);

        for run in [&older, &failed, &newer, &other] {
            ledger.record(run).await.unwrap();
        }

        assert_eq!(
            ledger.last_successful(def.id).map(|r| r.run_id),
            Some(newer.id)
        );
        assert_eq!(ledger.runs_for(def.id).len(), 3);
        assert_eq!(ledger.runs_for(def.id)[0].run_id, older.id);
        assert!(ledger.last_successful(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn test_publish_outcome_recorded_once() {
        let ledger = RunLedger::in_memory();
        let def = definition();
        let run = finished_run(&def, RunStatus::Succeeded);

        assert!(matches!(
            ledger
                .record_publish(run.id, PublishOutcome::Published { artifacts: vec![] })
                .await,
            Err(LedgerError::UnknownRun(_))
        ));

        ledger.record(&run).await.unwrap();
        ledger
            .record_publish(run.id, PublishOutcome::Published { artifacts: vec![] })
            .await
            .unwrap();
        let late = PublishOutcome::Failed {
            error: "late".to_string(),
            stored: vec![],
        };
        assert!(matches!(
            ledger.record_publish(run.id, late).await,
            Err(LedgerError::PublishAlreadyRecorded(_))
        ));
    }

    #[tokio::test]
    async fn test_ledger_reopens_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let def = definition();
        let run = finished_run(&def, RunStatus::Succeeded);
        let artifact = Artifact {
            name: "app".to_string(),
            source_run_id: run.id,
            paths: vec![PathBuf::from("out/app.exe")],
            storage_handle: StorageHandle("app-1".to_string()),
        };

        {
            let ledger = RunLedger::open(dir.path()).unwrap();
            ledger.record(&run).await.unwrap();
            ledger
                .record_publish(
                    run.id,
                    PublishOutcome::Published {
                        artifacts: vec![artifact.clone()],
                    },
                )
                .await
                .unwrap();
        }

        assert!(dir
            .path()
            .join(RUNS_DIR)
            .join(format!("{}.json", run.id))
            .is_file());

        let reopened = RunLedger::open(dir.path()).unwrap();
        let record = reopened.get(run.id).unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(
            record.step_results[0].captured_output_paths,
            vec![PathBuf::from("out/app.exe")]
        );
        assert_eq!(
            reopened.publish_outcome(run.id).unwrap().outcome,
            PublishOutcome::Published {
                artifacts: vec![artifact]
            }
        );
        assert!(matches!(
            reopened.record(&run).await,
            Err(LedgerError::AlreadyRecorded(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records() {
        let ledger = Arc::new(RunLedger::in_memory());
        let def = definition();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let run = finished_run(&def, RunStatus::Succeeded);
            tasks.spawn(async move { ledger.record(&run).await.map(|_| ()) });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(ledger.len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_of_same_run_persist_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(RunLedger::open(dir.path()).unwrap());
        let run = Arc::new(finished_run(&definition(), RunStatus::Succeeded));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let run = run.clone();
            tasks.spawn(async move { ledger.record(&run).await.is_ok() });
        }
        let mut recorded = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                recorded += 1;
            }
        }

        assert_eq!(recorded, 1);
        let files: Vec<_> = fs::read_dir(dir.path().join(RUNS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from(format!("{}.json", run.id))]);
    }

    #[tokio::test]
    async fn test_failed_write_releases_claim() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::open(dir.path()).unwrap();
        let run = finished_run(&definition(), RunStatus::Succeeded);

        fs::remove_dir_all(dir.path().join(RUNS_DIR)).unwrap();
        assert!(matches!(ledger.record(&run).await, Err(LedgerError::Io(_))));
        assert!(ledger.get(run.id).is_none());

        fs::create_dir_all(dir.path().join(RUNS_DIR)).unwrap();
        assert!(ledger.record(&run).await.is_ok());
    }
}
