//! Trigger domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::CronSchedule;

/// A condition that starts a new run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fires once per slot of a cron schedule
    Schedule { cron: CronSchedule },

    /// Fires when an operator asks for a run
    ManualDispatch,
}

impl TriggerSpec {
    /// Creates a schedule trigger, validating the expression
    pub fn schedule(expression: &str) -> Result<Self, crate::ConfigError> {
        Ok(Self::Schedule {
            cron: CronSchedule::parse(expression)?,
        })
    }
}

/// An externally delivered "run now" event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualDispatch {
    pub definition_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

/// The trigger that started a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTrigger {
    Schedule {
        /// Index of the trigger within the definition
        index: usize,
        /// The scheduled slot that fired
        slot: DateTime<Utc>,
    },
    Manual {
        requested_at: DateTime<Utc>,
    },
}

/// Request produced by the trigger evaluator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub definition_id: Uuid,
    pub trigger: RunTrigger,
    pub requested_at: DateTime<Utc>,
}
