//! Trigger evaluation
//!
//! Decides, for one pipeline definition, whether a new run should start.
//! Evaluation is a pure function of the definition, its [`TriggerState`],
//! the current time and an optional manual dispatch event, so the same
//! inputs always produce the same decision.

use chrono::{DateTime, Utc};
use kiln_core::domain::pipeline::PipelineDefinition;
use kiln_core::domain::run::RunRecord;
use kiln_core::domain::trigger::{ManualDispatch, RunRequest, RunTrigger, TriggerSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-definition trigger state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerState {
    /// Schedule slots strictly older than this never fire
    pub armed_at: DateTime<Utc>,

    /// Last fired slot per schedule trigger index
    #[serde(default)]
    pub last_fired: BTreeMap<usize, DateTime<Utc>>,
}

impl TriggerState {
    /// Fresh state; only slots at or after `now` can fire
    pub fn armed_at(now: DateTime<Utc>) -> Self {
        Self {
            armed_at: now,
            last_fired: BTreeMap::new(),
        }
    }

    /// Rebuilds the state after a restart
    ///
    /// Arms from the start of the last successful run and restores the slot
    /// that run fired, so that slot is not fired again while the latest slot
    /// missed during downtime still fires.
    pub fn resume(last_successful: Option<&RunRecord>, now: DateTime<Utc>) -> Self {
        let Some(record) = last_successful else {
            return Self::armed_at(now);
        };

        let mut state = Self::armed_at(record.started_at.min(now));
        if let RunTrigger::Schedule { index, slot } = record.trigger {
            state.last_fired.insert(index, slot);
        }
        state
    }
}

/// Evaluates the triggers of `definition` at `now`
///
/// Returns at most one request. A manual event coinciding with a due
/// schedule slot yields the manual request; the slot is still marked fired.
pub fn evaluate(
    definition: &PipelineDefinition,
    state: &mut TriggerState,
    now: DateTime<Utc>,
    manual: Option<&ManualDispatch>,
) -> Option<RunRequest> {
    let mut due: Option<(usize, DateTime<Utc>)> = None;

    for (index, trigger) in definition.triggers.iter().enumerate() {
        let TriggerSpec::Schedule { cron } = trigger else {
            continue;
        };
        let Some(slot) = cron.latest_at_or_before(now) else {
            continue;
        };
        if slot < state.armed_at {
            continue;
        }
        if state
            .last_fired
            .get(&index)
            .is_some_and(|fired| *fired >= slot)
        {
            continue;
        }

        state.last_fired.insert(index, slot);
        debug!(
            "Schedule '{}' of pipeline '{}' due at {}",
            cron, definition.name, slot
        );
        if due.is_none() {
            due = Some((index, slot));
        }
    }

    let manual = manual.filter(|event| accepts_manual(definition, event));

    if let Some(event) = manual {
        if let Some((_, slot)) = due {
            debug!(
                "Manual dispatch of '{}' coalesced with slot {}",
                definition.name, slot
            );
        }
        return Some(RunRequest {
            definition_id: definition.id,
            trigger: RunTrigger::Manual {
                requested_at: event.requested_at,
            },
            requested_at: now,
        });
    }

    due.map(|(index, slot)| RunRequest {
        definition_id: definition.id,
        trigger: RunTrigger::Schedule { index, slot },
        requested_at: now,
    })
}

fn accepts_manual(definition: &PipelineDefinition, event: &ManualDispatch) -> bool {
    if event.definition_id != definition.id {
        warn!(
            "Ignoring manual dispatch for {} sent to pipeline '{}'",
            event.definition_id, definition.name
        );
        return false;
    }
    if !definition.is_manually_dispatchable() {
        warn!(
            "Pipeline '{}' does not accept manual dispatch, ignoring event",
            definition.name
        );
        return false;
    }
    true
}

/// A definition together with its trigger state
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    definition: Arc<PipelineDefinition>,
    state: TriggerState,
}

impl TriggerEvaluator {
    pub fn new(definition: Arc<PipelineDefinition>, state: TriggerState) -> Self {
        Self { definition, state }
    }

    pub fn definition(&self) -> &Arc<PipelineDefinition> {
        &self.definition
    }

    pub fn state(&self) -> &TriggerState {
        &self.state
    }

    pub fn evaluate(
        &mut self,
        now: DateTime<Utc>,
        manual: Option<&ManualDispatch>,
    ) -> Option<RunRequest> {
        evaluate(&self.definition, &mut self.state, now, manual)
    }
}
