//! Engine configuration
//!
//! Defines the configurable parameters of the execution engine: where run
//! workspaces live, how long a step may run, and which shell runs commands.

use std::path::PathBuf;
use std::time::Duration;

/// Execution engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory under which each run gets its own workspace
    pub workspace_base: PathBuf,

    /// Step timeout used when a step does not declare one
    pub step_timeout: Duration,

    /// Shell used by the `run-command` action
    pub default_shell: String,
}

impl EngineConfig {
    /// Creates a new configuration with defaults
    pub fn new(workspace_base: PathBuf) -> Self {
        Self {
            workspace_base,
            step_timeout: Duration::from_secs(3600), // 1 hour
            default_shell: "sh".to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKSPACE_BASE (optional, default: <tmp>/kiln)
    /// - STEP_TIMEOUT (optional, seconds, default: 3600)
    /// - DEFAULT_SHELL (optional, default: sh)
    pub fn from_env() -> Self {
        let workspace_base = std::env::var("WORKSPACE_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_workspace_base());

        let step_timeout = std::env::var("STEP_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3600));

        let default_shell = std::env::var("DEFAULT_SHELL").unwrap_or_else(|_| "sh".to_string());

        Self {
            workspace_base,
            step_timeout,
            default_shell,
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_base.as_os_str().is_empty() {
            anyhow::bail!("workspace_base cannot be empty");
        }

        if self.step_timeout.as_secs() == 0 {
            anyhow::bail!("step_timeout must be at least one second");
        }

        if self.default_shell.trim().is_empty() {
            anyhow::bail!("default_shell cannot be empty");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(default_workspace_base())
    }
}

fn default_workspace_base() -> PathBuf {
    std::env::temp_dir().join("kiln")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.step_timeout, Duration::from_secs(3600));
        assert_eq!(config.default_shell, "sh");
        assert!(config.workspace_base.ends_with("kiln"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();

        config.step_timeout = Duration::from_millis(10);
        assert!(config.validate().is_err());

        config.step_timeout = Duration::from_secs(5);
        config.default_shell = String::new();
        assert!(config.validate().is_err());

        config.default_shell = "bash".to_string();
        config.workspace_base = PathBuf::new();
        assert!(config.validate().is_err());
    }
}
