//! Per-project run state and locking

use crate::config::RunConfiguration;
use crate::error::{OrchestratorError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Lifecycle state of one project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Cleaning,
    Rendering,
    Deploying,
    /// Swarm only
    Scaling,
    Polling,
    Running,
    StoppingCleaning,
    Failed,
}

impl RunState {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;

        if next == Failed {
            return self != Idle;
        }
        matches!(
            (self, next),
            (Idle, Cleaning)
                | (Idle, StoppingCleaning)
                | (Cleaning, Rendering)
                | (Rendering, Deploying)
                | (Deploying, Scaling)
                | (Deploying, Polling)
                | (Scaling, Polling)
                | (Polling, Running)
                | (Polling, StoppingCleaning)
                | (Running, StoppingCleaning)
                | (StoppingCleaning, Idle)
                | (Failed, Cleaning)
                | (Failed, StoppingCleaning)
        )
    }

    /// Whether a lifecycle verb is midway through this state
    pub fn is_in_flight(self) -> bool {
        !matches!(self, RunState::Idle | RunState::Running | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Cleaning => "cleaning",
            RunState::Rendering => "rendering",
            RunState::Deploying => "deploying",
            RunState::Scaling => "scaling",
            RunState::Polling => "polling",
            RunState::Running => "running",
            RunState::StoppingCleaning => "stopping",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct RunSlot {
    state: RunState,
    config: Option<RunConfiguration>,
    expected: BTreeMap<String, u32>,
}

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<RunSlot>>>>>;

/// Run locks and states of every project that is not idle
///
/// A slot is dropped again once its lease ends in `Idle`.
#[derive(Debug, Default)]
pub struct RunRegistry {
    slots: Slots,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the run lock for `project` without waiting
    pub fn try_acquire(&self, project: &str) -> Result<RunLease> {
        // Locking the slot under the map lock keeps a lease from landing on a slot being removed
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(project.to_string()).or_default().clone();

        let guard = slot.try_lock_owned().map_err(|_| {
            OrchestratorError::config(format!("Project {} has a run already in progress", project))
                .with_resource(project)
        })?;

        Ok(RunLease {
            project: project.to_string(),
            slot: guard,
            slots: self.slots.clone(),
        })
    }

    /// Current state, or `None` while a lease on the project is held
    ///
    /// Projects without a slot are idle.
    pub fn state(&self, project: &str) -> Option<RunState> {
        match self.slot(project) {
            Some(slot) => slot.try_lock().ok().map(|slot| slot.state),
            None => Some(RunState::Idle),
        }
    }

    /// Number of projects with a slot
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configurations of every project currently running
    pub fn running(&self) -> Vec<RunConfiguration> {
        let slots: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.try_lock().ok()?;
                if slot.state == RunState::Running {
                    slot.config.clone()
                } else {
                    None
                }
            })
            .collect()
    }

    fn slot(&self, project: &str) -> Option<Arc<AsyncMutex<RunSlot>>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project)
            .cloned()
    }
}

/// Exclusive access to one project's run; released on drop
#[derive(Debug)]
pub struct RunLease {
    project: String,
    slot: OwnedMutexGuard<RunSlot>,
    slots: Slots,
}

impl RunLease {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn state(&self) -> RunState {
        self.slot.state
    }

    /// Replica counts recorded by the last start
    pub fn expected(&self) -> &BTreeMap<String, u32> {
        &self.slot.expected
    }

    /// Move to `next`, rejecting transitions outside the table
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        let current = self.slot.state;
        if !current.can_transition_to(next) {
            return Err(OrchestratorError::config(format!(
                "Invalid state transition for {}: {} -> {}",
                self.project, current, next
            ))
            .with_resource(&self.project));
        }
        debug!(project = %self.project, from = %current, to = %next, "State transition");
        self.slot.state = next;
        Ok(())
    }

    /// Enter `Failed`; a no-op from `Idle`
    pub fn fail(&mut self) {
        if self.slot.state != RunState::Idle {
            debug!(project = %self.project, from = %self.slot.state, "Run failed");
            self.slot.state = RunState::Failed;
        }
    }

    pub(crate) fn record(&mut self, config: &RunConfiguration, expected: BTreeMap<String, u32>) {
        self.slot.config = Some(config.clone());
        self.slot.expected = expected;
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let state = self.slot.state;
        if state.is_in_flight() {
            warn!(project = %self.project, state = %state, "Run abandoned midway, marking it failed");
            self.slot.state = RunState::Failed;
        }

        if self.slot.state == RunState::Idle {
            self.slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.project);
        }
    }
}
