//! Batch status state machine shared by job and step executions.

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job execution or step execution.
///
/// `Starting -> Started -> {Completed, Failed, Stopping -> Stopped}`. A restart
/// creates a new execution that re-enters at `Starting`. `Abandoned` is only
/// reachable from a terminal state through an explicit administrative action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
}

impl BatchStatus {
    /// Upper-case status name. This is also the default exit status.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }

    /// Terminal states never change again (except the admin-only move to `Abandoned`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Stopped
                | BatchStatus::Abandoned
        )
    }

    /// Whether an execution in this state is still being driven by the engine.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// Whether moving from `self` to `next` is a legal state transition.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        match (self, next) {
            (Starting, Started | Failed | Stopping | Stopped) => true,
            (Started, Completed | Failed | Stopping) => true,
            (Stopping, Stopped | Failed) => true,
            (Completed | Failed | Stopped, Abandoned) => true,
            _ => false,
        }
    }

    /// Ordering used when aggregating concurrent outcomes (split flows,
    /// partitions). Higher is more severe.
    pub fn severity(&self) -> u8 {
        match self {
            BatchStatus::Completed => 0,
            BatchStatus::Starting | BatchStatus::Started => 1,
            BatchStatus::Stopping | BatchStatus::Stopped => 2,
            BatchStatus::Failed => 3,
            BatchStatus::Abandoned => 4,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "FAILED" => Ok(BatchStatus::Failed),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            other => Err(format!("invalid batch status: '{other}'")),
        }
    }
}
