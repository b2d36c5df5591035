//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task lifecycle state.
///
/// Transitions run `Waiting -> Idle -> Finished`, once each, with no
/// back-edges. Composites never enter a worker-executing state; a composite
/// in `Idle` is simply waiting for its children to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Persisted, not yet activated.
    Waiting,

    /// Activated; children in flight (composite) or work claimed (leaf).
    Idle,

    /// Terminal, successfully or with a persisted error.
    Finished,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Idle => "idle",
            TaskState::Finished => "finished",
        }
    }

    /// The JSON-encoded form stored in the record hash, quotes included.
    /// Transaction validates compare against this exact string.
    pub fn encoded(self) -> String {
        format!("\"{}\"", self.as_str())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished)
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskState::Waiting),
            "idle" => Ok(TaskState::Idle),
            "finished" => Ok(TaskState::Finished),
            _ => Err(format!("unknown task state: {s}")),
        }
    }
}
