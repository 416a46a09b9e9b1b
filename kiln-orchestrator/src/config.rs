//! Orchestrator configuration
//!
//! Defines where pipeline definitions, the ledger and published artifacts
//! live, how often triggers are evaluated, and how many runs may execute at
//! once.

use anyhow::Context;
use kiln_runner::EngineConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::service::PublishConfig;

/// How runs of the same definition relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// Runs of one definition may overlap, each in its own workspace
    #[default]
    Parallel,

    /// At most one run per definition executes at a time; later runs wait
    SerializePerDefinition,
}

impl FromStr for ConcurrencyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(Self::Parallel),
            "serialize" | "serialize-per-definition" => Ok(Self::SerializePerDefinition),
            other => anyhow::bail!(
                "Unknown concurrency policy '{}' (expected 'parallel' or 'serialize')",
                other
            ),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// JSON pipeline definition files loaded at startup
    pub pipeline_files: Vec<PathBuf>,

    /// Directory of the persisted ledger; in-memory when unset
    pub ledger_dir: Option<PathBuf>,

    /// Directory the local artifact store copies artifacts into
    pub artifact_dir: PathBuf,

    /// How often schedule triggers are evaluated
    pub tick_interval: Duration,

    pub max_parallel_runs: usize,

    pub concurrency_policy: ConcurrencyPolicy,

    pub publish: PublishConfig,

    pub engine: EngineConfig,
}

impl OrchestratorConfig {
    /// Creates a new configuration with defaults
    pub fn new(pipeline_files: Vec<PathBuf>) -> Self {
        Self {
            pipeline_files,
            ledger_dir: None,
            artifact_dir: PathBuf::from("./artifacts"),
            tick_interval: Duration::from_secs(30),
            max_parallel_runs: 2,
            concurrency_policy: ConcurrencyPolicy::Parallel,
            publish: PublishConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - PIPELINE_FILES (required, comma separated JSON files)
    /// - LEDGER_DIR (optional, in-memory ledger when unset)
    /// - ARTIFACT_DIR (optional, default: ./artifacts)
    /// - TICK_INTERVAL (optional, seconds, default: 30)
    /// - MAX_PARALLEL_RUNS (optional, default: 2)
    /// - CONCURRENCY_POLICY (optional, parallel | serialize, default: parallel)
    /// - PUBLISH_ALLOW_EMPTY (optional, default: false)
    /// - PUBLISH_MAX_ATTEMPTS (optional, default: 3)
    /// - PUBLISH_BACKOFF_MS (optional, default: 500)
    ///
    /// Engine settings are read by [`EngineConfig::from_env`].
    pub fn from_env() -> anyhow::Result<Self> {
        let pipeline_files = std::env::var("PIPELINE_FILES")
            .map_err(|_| anyhow::anyhow!("PIPELINE_FILES environment variable not set"))?;
        let pipeline_files = parse_file_list(&pipeline_files);

        let mut config = Self::new(pipeline_files);

        config.ledger_dir = std::env::var("LEDGER_DIR").ok().map(PathBuf::from);

        if let Ok(dir) = std::env::var("ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(dir);
        }

        if let Some(secs) = env_parse::<u64>("TICK_INTERVAL") {
            config.tick_interval = Duration::from_secs(secs);
        }

        if let Some(max) = env_parse::<usize>("MAX_PARALLEL_RUNS") {
            config.max_parallel_runs = max;
        }

        if let Ok(policy) = std::env::var("CONCURRENCY_POLICY") {
            config.concurrency_policy = policy
                .parse()
                .context("Invalid CONCURRENCY_POLICY")?;
        }

        if let Some(allow) = env_parse::<bool>("PUBLISH_ALLOW_EMPTY") {
            config.publish.allow_empty = allow;
        }

        if let Some(attempts) = env_parse::<u32>("PUBLISH_MAX_ATTEMPTS") {
            config.publish.max_attempts = attempts;
        }

        if let Some(ms) = env_parse::<u64>("PUBLISH_BACKOFF_MS") {
            config.publish.initial_backoff = Duration::from_millis(ms);
        }

        config.engine = EngineConfig::from_env();

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline_files.is_empty() {
            anyhow::bail!("at least one pipeline file is required");
        }

        if self.tick_interval.as_secs() == 0 {
            anyhow::bail!("tick_interval must be at least one second");
        }

        if self.max_parallel_runs == 0 {
            anyhow::bail!("max_parallel_runs must be at least 1");
        }

        if self.publish.max_attempts == 0 {
            anyhow::bail!("publish max_attempts must be at least 1");
        }

        if self.artifact_dir.as_os_str().is_empty() {
            anyhow::bail!("artifact_dir cannot be empty");
        }

        self.engine.validate()
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn parse_file_list(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}
