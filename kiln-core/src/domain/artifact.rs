//! Artifact domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque reference returned by the artifact storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageHandle(pub String);

impl fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named, persisted set of files produced by a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub source_run_id: Uuid,
    /// Paths relative to the run workspace
    pub paths: Vec<PathBuf>,
    pub storage_handle: StorageHandle,
}

/// Publishing outcome, tracked separately from the run's own status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published { artifacts: Vec<Artifact> },
    Failed {
        error: String,
        /// Artifacts persisted before the failure
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        stored: Vec<Artifact>,
    },
}

/// Persisted publishing outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: PublishOutcome,
}
