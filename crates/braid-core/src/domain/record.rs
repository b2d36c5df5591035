//! Task record: the persisted hash behind `{prefix}{id}`.
//!
//! Every field value is individually JSON-encoded, so a record is a mapping
//! from field name to a JSON string. Handlers read a record once per command
//! and never hold it across suspension points beyond the one transaction
//! they assemble from it.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::ids::{TaskId, TaskUid};
use super::state::TaskState;
use crate::error::BraidError;

/// Field names of the record hash.
pub mod fields {
    pub const STATE: &str = "state";
    pub const ARGS: &str = "args";
    pub const CHILDREN: &str = "children";
    pub const CHILDREN_FINISHED: &str = "children_finished";
    pub const TOTAL: &str = "total";
    pub const PROGRESS: &str = "progress";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const POOL: &str = "pool";
    pub const PARENT: &str = "parent";
    pub const PARENT_POOL: &str = "parent_pool";
    pub const PARENT_UID: &str = "parent_uid";
    pub const REMOVE_DELAY: &str = "removeDelay";
    pub const NAME: &str = "name";
    pub const UID: &str = "uid";
    pub const USER_DATA: &str = "user_data";
}

/// Child-side reference to a parent task.
///
/// This is a relation plus lookup data, never ownership: the parent is
/// addressed through the store when a terminal command is emitted upward.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRef {
    pub id: TaskId,
    pub pool: String,
    pub uid: TaskUid,
}

/// In-memory copy of a persisted task record.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub state: TaskState,
    pub args: Vec<Value>,
    /// Child task ids, in activation order. Empty for leaves.
    pub children: Vec<TaskId>,
    /// How many children have reported. Only meaningful for composites.
    pub children_finished: u64,
    pub total: u64,
    pub progress: u64,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub pool: String,
    pub parent: Option<ParentRef>,
    /// Milliseconds a finished record lingers before the janitor may remove
    /// it. The removal deadline is the `finished` sorted-set score.
    pub remove_delay: i64,
    /// Registered template name. The worker resolves handlers through it.
    pub name: String,
    pub uid: TaskUid,
    pub user_data: Option<Value>,
}

fn enc<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("record field serialization is infallible")
}

fn dec<T: DeserializeOwned>(
    map: &HashMap<String, String>,
    field: &str,
) -> Result<Option<T>, BraidError> {
    match map.get(field) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| BraidError::Codec(format!("record field {field}: {e}"))),
    }
}

fn dec_required<T: DeserializeOwned>(
    map: &HashMap<String, String>,
    field: &str,
) -> Result<T, BraidError> {
    dec(map, field)?.ok_or_else(|| BraidError::Codec(format!("record field {field} missing")))
}

impl TaskRecord {
    /// Serialize to `(field, JSON value)` pairs for the first store write.
    /// Absent optional fields are omitted rather than written as null.
    pub fn encode(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (fields::STATE, self.state.encoded()),
            (fields::ARGS, enc(&self.args)),
            (fields::TOTAL, enc(&self.total)),
            (fields::PROGRESS, enc(&self.progress)),
            (fields::POOL, enc(&self.pool)),
            (fields::REMOVE_DELAY, enc(&self.remove_delay)),
            (fields::NAME, enc(&self.name)),
            (fields::UID, enc(&self.uid)),
        ];
        if !self.children.is_empty() {
            out.push((fields::CHILDREN, enc(&self.children)));
            out.push((fields::CHILDREN_FINISHED, enc(&self.children_finished)));
        }
        if let Some(result) = &self.result {
            out.push((fields::RESULT, enc(result)));
        }
        if let Some(error) = &self.error {
            out.push((fields::ERROR, enc(error)));
        }
        if let Some(parent) = &self.parent {
            out.push((fields::PARENT, enc(&parent.id)));
            out.push((fields::PARENT_POOL, enc(&parent.pool)));
            out.push((fields::PARENT_UID, enc(&parent.uid)));
        }
        if let Some(user_data) = &self.user_data {
            out.push((fields::USER_DATA, enc(user_data)));
        }
        out
    }

    pub fn decode(map: &HashMap<String, String>) -> Result<Self, BraidError> {
        let parent = match dec::<TaskId>(map, fields::PARENT)? {
            None => None,
            Some(id) => Some(ParentRef {
                id,
                pool: dec_required(map, fields::PARENT_POOL)?,
                uid: dec_required(map, fields::PARENT_UID)?,
            }),
        };

        Ok(Self {
            state: dec_required(map, fields::STATE)?,
            args: dec(map, fields::ARGS)?.unwrap_or_default(),
            children: dec(map, fields::CHILDREN)?.unwrap_or_default(),
            children_finished: dec(map, fields::CHILDREN_FINISHED)?.unwrap_or(0),
            total: dec(map, fields::TOTAL)?.unwrap_or(0),
            progress: dec(map, fields::PROGRESS)?.unwrap_or(0),
            result: dec(map, fields::RESULT)?,
            error: dec(map, fields::ERROR)?,
            pool: dec_required(map, fields::POOL)?,
            parent,
            remove_delay: dec(map, fields::REMOVE_DELAY)?.unwrap_or(0),
            name: dec_required(map, fields::NAME)?,
            uid: dec_required(map, fields::UID)?,
            user_data: dec(map, fields::USER_DATA)?,
        })
    }

    pub fn is_composite(&self) -> bool {
        !self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TaskRecord {
        TaskRecord {
            state: TaskState::Waiting,
            args: vec![json!(1), json!("two")],
            children: vec![TaskId::generate(), TaskId::generate()],
            children_finished: 0,
            total: 2,
            progress: 0,
            result: Some(json!([])),
            error: None,
            pool: "default".into(),
            parent: Some(ParentRef {
                id: TaskId::generate(),
                pool: "default".into(),
                uid: TaskUid::generate(),
            }),
            remove_delay: 30_000,
            name: "group".into(),
            uid: TaskUid::generate(),
            user_data: None,
        }
    }

    fn to_map(record: &TaskRecord) -> HashMap<String, String> {
        record
            .encode()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let record = sample();
        let back = TaskRecord::decode(&to_map(&record)).unwrap();

        assert_eq!(back.state, record.state);
        assert_eq!(back.args, record.args);
        assert_eq!(back.children, record.children);
        assert_eq!(back.children_finished, 0);
        assert_eq!(back.total, 2);
        assert_eq!(back.result, Some(json!([])));
        assert_eq!(back.error, None);
        assert_eq!(back.parent, record.parent);
        assert_eq!(back.remove_delay, 30_000);
        assert_eq!(back.name, "group");
        assert_eq!(back.uid, record.uid);
    }

    #[test]
    fn leaf_record_omits_children_fields() {
        let mut record = sample();
        record.children.clear();
        record.result = None;
        record.parent = None;

        let map = to_map(&record);
        assert!(!map.contains_key(fields::CHILDREN));
        assert!(!map.contains_key(fields::CHILDREN_FINISHED));
        assert!(!map.contains_key(fields::PARENT));

        let back = TaskRecord::decode(&map).unwrap();
        assert!(back.children.is_empty());
        assert_eq!(back.children_finished, 0);
        assert!(back.parent.is_none());
        assert!(!back.is_composite());
    }

    #[test]
    fn field_values_are_json_encoded_strings() {
        let record = sample();
        let map = to_map(&record);

        assert_eq!(map[fields::STATE], "\"waiting\"");
        assert_eq!(map[fields::POOL], "\"default\"");
        assert_eq!(map[fields::TOTAL], "2");
    }

    #[test]
    fn decode_rejects_missing_state() {
        let mut map = to_map(&sample());
        map.remove(fields::STATE);
        assert!(TaskRecord::decode(&map).is_err());
    }
}
