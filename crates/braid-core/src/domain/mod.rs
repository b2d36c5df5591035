//! Domain model (ids, task state, command envelope, task record).

pub mod command;
pub mod ids;
pub mod record;
pub mod state;

pub use command::{ClaimedCommand, Command, CommandData, CommandType};
pub use ids::{TaskId, TaskUid};
pub use record::{ParentRef, TaskRecord};
pub use state::TaskState;

use std::fmt;

/// What a task is: a leaf that runs user code, or a composite whose work is
/// its children's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Leaf,
    Chain,
    Group,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Leaf => "task",
            TaskKind::Chain => "chain",
            TaskKind::Group => "group",
        }
    }

    pub fn is_composite(self) -> bool {
        matches!(self, TaskKind::Chain | TaskKind::Group)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
