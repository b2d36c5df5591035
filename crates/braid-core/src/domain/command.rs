//! Command envelope: the addressed message consumed by exactly one task
//! handler.
//!
//! A command's canonical form is its stable JSON serialization. That string
//! is the command's identity inside the store's sorted sets, and removing it
//! from `commands_locked` is the mutual-exclusion primitive every handler
//! transaction is built on. The canonical string is produced once, at
//! emission, and travels byte-for-byte through claim and lock removal; no
//! two independent serializations are ever compared.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{TaskId, TaskUid};
use crate::error::BraidError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Start the target task.
    Activate,

    /// A child reports successful completion (optional `data.result`).
    Result,

    /// A child reports failure (`data.error`).
    Error,

    /// A group re-enters itself to decide whether all children reported.
    GroupCheck,
}

/// Optional payload of a command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandData {
    /// The task the payload is about (the reporting child, for `result` and
    /// `error`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Addressed message `{to, to_uid, type, data?}`.
///
/// `to_uid` fences stale commands: the command is only valid while the live
/// record at `to` still carries that uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub to: TaskId,
    pub to_uid: TaskUid,
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CommandData>,
}

impl Command {
    pub fn activate(to: TaskId, to_uid: TaskUid) -> Self {
        Self {
            to,
            to_uid,
            kind: CommandType::Activate,
            data: None,
        }
    }

    pub fn result(to: TaskId, to_uid: TaskUid, from: TaskId, result: Option<Value>) -> Self {
        Self {
            to,
            to_uid,
            kind: CommandType::Result,
            data: Some(CommandData {
                id: Some(from),
                result,
                error: None,
            }),
        }
    }

    pub fn error(to: TaskId, to_uid: TaskUid, from: TaskId, error: Value) -> Self {
        Self {
            to,
            to_uid,
            kind: CommandType::Error,
            data: Some(CommandData {
                id: Some(from),
                result: None,
                error: Some(error),
            }),
        }
    }

    pub fn group_check(to: TaskId, to_uid: TaskUid) -> Self {
        Self {
            to,
            to_uid,
            kind: CommandType::GroupCheck,
            data: None,
        }
    }

    /// The canonical byte-string form used as the set member.
    ///
    /// Struct field order is fixed, so serializing the same command value
    /// always yields the same string.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).expect("command serialization is infallible")
    }

    pub fn parse(raw: &str) -> Result<Self, BraidError> {
        serde_json::from_str(raw).map_err(|e| BraidError::Codec(format!("bad command: {e}")))
    }

    /// The child's result carried by a `result` command, if any.
    pub fn result_value(&self) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.result.as_ref())
    }

    /// The error carried by an `error` command, if any.
    pub fn error_value(&self) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.error.as_ref())
    }
}

/// A command a worker has claimed off a pool queue.
///
/// `raw` is the exact member string that was moved into `commands_locked`.
/// Handler transactions must remove those exact bytes, so the claim carries
/// them alongside the decoded command.
#[derive(Debug, Clone)]
pub struct ClaimedCommand {
    pub pool: String,
    pub raw: String,
    pub command: Command,
}

impl ClaimedCommand {
    pub fn new(pool: impl Into<String>, raw: String) -> Result<Self, BraidError> {
        let command = Command::parse(&raw)?;
        Ok(Self {
            pool: pool.into(),
            raw,
            command,
        })
    }
}
