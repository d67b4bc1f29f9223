//! Swarm task rows as reported by `docker stack ps`

use crate::status::InstanceState;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Task state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Task is new
    #[default]
    New,
    /// Task is pending
    Pending,
    /// Task is assigned
    Assigned,
    /// Task is accepted
    Accepted,
    /// Task is preparing
    Preparing,
    /// Task is ready
    Ready,
    /// Task is starting
    Starting,
    /// Task is running
    Running,
    /// Task completed
    Complete,
    /// Task shutdown
    Shutdown,
    /// Task failed
    Failed,
    /// Task rejected
    Rejected,
    /// Task removed
    Remove,
    /// Task is orphaned
    Orphaned,
}

impl FromStr for TaskState {
    type Err = ();

    /// Parse the leading word of a `CurrentState` column ("Running 5 minutes ago")
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let word = s.split_whitespace().next().unwrap_or_default().to_lowercase();
        let state = match word.as_str() {
            "new" => TaskState::New,
            "pending" => TaskState::Pending,
            "assigned" => TaskState::Assigned,
            "accepted" => TaskState::Accepted,
            "preparing" => TaskState::Preparing,
            "ready" => TaskState::Ready,
            "starting" => TaskState::Starting,
            "running" => TaskState::Running,
            "complete" => TaskState::Complete,
            "shutdown" => TaskState::Shutdown,
            "failed" => TaskState::Failed,
            "rejected" => TaskState::Rejected,
            "remove" => TaskState::Remove,
            "orphaned" => TaskState::Orphaned,
            _ => return Err(()),
        };
        Ok(state)
    }
}

impl TaskState {
    /// Check if the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Complete
                | TaskState::Shutdown
                | TaskState::Failed
                | TaskState::Rejected
                | TaskState::Remove
                | TaskState::Orphaned
        )
    }

    /// Check if the task is running
    pub fn is_running(&self) -> bool {
        *self == TaskState::Running
    }

    /// Collapse into the backend-neutral instance state
    pub fn instance_state(&self) -> InstanceState {
        if self.is_running() {
            InstanceState::Running
        } else if self.is_terminal() {
            InstanceState::Stopped
        } else {
            InstanceState::Starting
        }
    }
}

/// One row of `docker stack ps --format '{{json .}}'`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    /// Task ID
    #[serde(default, rename = "ID")]
    pub id: String,
    /// Task name, `{stack}_{service}.{slot}`
    pub name: String,
    /// Free text such as "Running 12 seconds ago"
    #[serde(default)]
    pub current_state: String,
    #[serde(default)]
    pub desired_state: String,
    #[serde(default)]
    pub node: String,
    /// Scheduler error, empty when none
    #[serde(default)]
    pub error: String,
}

impl Task {
    /// Service name without the stack prefix and slot suffix
    pub fn service_name(&self, stack: &str) -> String {
        let prefix = format!("{}_", stack);
        let name = self.name.strip_prefix(&prefix).unwrap_or(&self.name);
        match name.rsplit_once('.') {
            Some((service, _slot)) => service.to_string(),
            None => name.to_string(),
        }
    }

    /// Parsed state; `None` when the state word is not recognised
    pub fn state(&self) -> Option<TaskState> {
        self.current_state.parse().ok()
    }

    pub fn instance_state(&self) -> InstanceState {
        self.state()
            .map(|s| s.instance_state())
            .unwrap_or(InstanceState::Unknown)
    }
}
