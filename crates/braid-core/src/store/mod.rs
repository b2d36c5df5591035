//! Store port and adapters.
//!
//! The engine is stateless; everything durable lives behind the `Store`
//! trait. `MemoryStore` backs tests and demos, `RedisStore` is the
//! production adapter. Both evaluate the same validate/exec transaction
//! contract atomically, which is the engine's only concurrency primitive.

mod memory;
mod redis;
pub mod txn;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::txn::{Expect, Op, Transaction};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::{TaskId, TaskRecord, TaskState};
use crate::error::BraidError;

/// Key layout under a configurable prefix.
///
/// - `{prefix}{id}` task record hash
/// - `{prefix}waiting`, `{prefix}idle` sets of task ids
/// - `{prefix}finished` sorted set of task ids, scored by removal deadline
/// - `{prefix}{pool}:commands` pending commands, scored by enqueue time
/// - `{prefix}{pool}:commands_locked` commands claimed by some worker
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn task(&self, id: &TaskId) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn state_set(&self, state: TaskState) -> String {
        format!("{}{}", self.prefix, state.as_str())
    }

    pub fn commands(&self, pool: &str) -> String {
        format!("{}{}:commands", self.prefix, pool)
    }

    pub fn commands_locked(&self, pool: &str) -> String {
        format!("{}{}:commands_locked", self.prefix, pool)
    }
}

/// Raw hash content of a task record, as read from the store.
pub type RawRecord = HashMap<String, String>;

/// Store port. Implementations must make `eval` atomic and `claim_next`
/// safe against concurrent claimers.
#[async_trait]
pub trait Store: Send + Sync {
    fn keys(&self) -> &KeySpace;

    /// Millisecond wall clock read from the store, not the local host, so
    /// enqueue scores stay consistent across workers.
    async fn now_ms(&self) -> Result<i64, BraidError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, BraidError>;

    /// Batched lookup, result aligned with `ids` (null for absent records).
    async fn get_tasks(&self, ids: &[TaskId]) -> Result<Vec<Option<TaskRecord>>, BraidError>;

    /// Evaluate a transaction. `true` means every validate matched and the
    /// exec ops were applied; `false` means nothing from `exec` happened.
    async fn eval(&self, txn: &Transaction) -> Result<bool, BraidError>;

    /// Claim the oldest due command on `pool`: move it from `commands` into
    /// `commands_locked` and return its member string. Members already
    /// present in `commands_locked` are skipped, so two in-flight copies of
    /// an identical canonical command are never merged into one lock entry.
    async fn claim_next(&self, pool: &str) -> Result<Option<String>, BraidError>;

    /// Drop a locked command without effecting any transition. Used when a
    /// handler decides the command is stale or an intentional no-op.
    async fn discard_locked(&self, pool: &str, raw: &str) -> Result<(), BraidError>;
}

pub(crate) fn decode_record(raw: RawRecord) -> Result<Option<TaskRecord>, BraidError> {
    if raw.is_empty() {
        return Ok(None);
    }
    TaskRecord::decode(&raw).map(Some)
}
