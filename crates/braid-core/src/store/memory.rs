//! In-memory store implementation.
//!
//! Backs tests and demos with the same transaction semantics as the Redis
//! adapter: validate ops run in order (effects included), and exec ops only
//! apply when every validate matched. Everything happens under one lock, so
//! an `eval` call is atomic exactly like the store-side script.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use super::txn::{Op, Transaction};
use super::{decode_record, KeySpace, Store};
use crate::domain::{TaskId, TaskRecord};
use crate::error::BraidError;

#[derive(Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    /// Sorted sets as `(score, member)` pairs; small enough to scan.
    zsets: HashMap<String, Vec<(i64, String)>>,
    /// Last clock read, for the monotonic bump.
    last_now_ms: i64,
}

impl MemoryState {
    fn apply(&mut self, op: &Op) -> Value {
        match op {
            Op::SAdd { key, member } => {
                let added = self.sets.entry(key.clone()).or_default().insert(member.clone());
                Value::from(added as i64)
            }
            Op::SRem { key, member } => {
                let removed = self
                    .sets
                    .get_mut(key)
                    .map(|s| s.remove(member))
                    .unwrap_or(false);
                Value::from(removed as i64)
            }
            Op::ZAdd { key, score, member } => {
                let zset = self.zsets.entry(key.clone()).or_default();
                if let Some(entry) = zset.iter_mut().find(|(_, m)| m == member) {
                    entry.0 = *score;
                    Value::from(0)
                } else {
                    zset.push((*score, member.clone()));
                    Value::from(1)
                }
            }
            Op::ZRem { key, member } => {
                let removed = match self.zsets.get_mut(key) {
                    Some(zset) => {
                        let before = zset.len();
                        zset.retain(|(_, m)| m != member);
                        before - zset.len()
                    }
                    None => 0,
                };
                Value::from(removed as i64)
            }
            Op::HSet { key, field, value } => {
                let added = self
                    .hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone())
                    .is_none();
                Value::from(added as i64)
            }
            Op::HIncrBy { key, field, by } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                let current: i64 = hash
                    .get(field)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let next = current + by;
                hash.insert(field.clone(), next.to_string());
                Value::from(next)
            }
            Op::HGet { key, field } => self
                .hashes
                .get(key)
                .and_then(|h| h.get(field))
                .map(|v| Value::from(v.as_str()))
                .unwrap_or(Value::Null),
        }
    }

    fn now_ms(&mut self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let now = wall.max(self.last_now_ms + 1);
        self.last_now_ms = now;
        now
    }
}

pub struct MemoryStore {
    keys: KeySpace,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            keys: KeySpace::new(prefix),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Delete a task record outright, simulating the janitor or an external
    /// cancellation. Tests use this to exercise the missing-child paths.
    pub async fn remove_task(&self, id: &TaskId) {
        let mut state = self.state.lock().await;
        let key = self.keys.task(id);
        state.hashes.remove(&key);
    }

    /// Members of a plain set, for assertions.
    pub async fn set_members(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Members of a sorted set in score order, for assertions.
    pub async fn zset_members(&self, key: &str) -> Vec<(i64, String)> {
        let state = self.state.lock().await;
        let mut members = state.zsets.get(key).cloned().unwrap_or_default();
        members.sort();
        members
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn now_ms(&self) -> Result<i64, BraidError> {
        let mut state = self.state.lock().await;
        Ok(state.now_ms())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, BraidError> {
        let state = self.state.lock().await;
        let raw = state
            .hashes
            .get(&self.keys.task(id))
            .cloned()
            .unwrap_or_default();
        decode_record(raw)
    }

    async fn get_tasks(&self, ids: &[TaskId]) -> Result<Vec<Option<TaskRecord>>, BraidError> {
        let state = self.state.lock().await;
        ids.iter()
            .map(|id| {
                let raw = state
                    .hashes
                    .get(&self.keys.task(id))
                    .cloned()
                    .unwrap_or_default();
                decode_record(raw)
            })
            .collect()
    }

    async fn eval(&self, txn: &Transaction) -> Result<bool, BraidError> {
        let mut state = self.state.lock().await;
        for entry in &txn.validate {
            if state.apply(&entry.op) != entry.expected {
                return Ok(false);
            }
        }
        for op in &txn.exec {
            state.apply(op);
        }
        Ok(true)
    }

    async fn claim_next(&self, pool: &str) -> Result<Option<String>, BraidError> {
        let commands = self.keys.commands(pool);
        let locked = self.keys.commands_locked(pool);

        let mut state = self.state.lock().await;
        let now = state.now_ms();

        let already_locked: HashSet<String> = state
            .zsets
            .get(&locked)
            .map(|z| z.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default();

        let candidate = state
            .zsets
            .get(&commands)
            .and_then(|zset| {
                zset.iter()
                    .filter(|(score, member)| *score <= now && !already_locked.contains(member))
                    .min_by(|a, b| a.cmp(b))
                    .cloned()
            });

        let Some((_, member)) = candidate else {
            return Ok(None);
        };

        state.apply(&Op::ZRem {
            key: commands,
            member: member.clone(),
        });
        state.apply(&Op::ZAdd {
            key: locked,
            score: now,
            member: member.clone(),
        });
        Ok(Some(member))
    }

    async fn discard_locked(&self, pool: &str, raw: &str) -> Result<(), BraidError> {
        let mut state = self.state.lock().await;
        state.apply(&Op::ZRem {
            key: self.keys.commands_locked(pool),
            member: raw.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskState;

    fn hset(key: &str, field: &str, value: &str) -> Op {
        Op::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn eval_applies_exec_only_when_validates_pass() {
        let store = MemoryStore::new("p:");

        let mut setup = Transaction::new();
        setup.run(hset("p:t", "state", "\"waiting\""));
        assert!(store.eval(&setup).await.unwrap());

        let mut good = Transaction::new();
        good.expect(
            "\"waiting\"",
            Op::HGet {
                key: "p:t".into(),
                field: "state".into(),
            },
        );
        good.run(hset("p:t", "state", "\"idle\""));
        assert!(store.eval(&good).await.unwrap());

        // Same transaction again: the state moved on, so validation fails
        // and the exec ops are not applied.
        let mut stale = Transaction::new();
        stale.expect(
            "\"waiting\"",
            Op::HGet {
                key: "p:t".into(),
                field: "state".into(),
            },
        );
        stale.run(hset("p:t", "state", "\"finished\""));
        assert!(!store.eval(&stale).await.unwrap());

        let mut check = Transaction::new();
        check.expect(
            "\"idle\"",
            Op::HGet {
                key: "p:t".into(),
                field: "state".into(),
            },
        );
        assert!(store.eval(&check).await.unwrap());
    }

    #[tokio::test]
    async fn zrem_validate_consumes_exactly_once() {
        let store = MemoryStore::new("p:");

        let mut setup = Transaction::new();
        setup.run(Op::ZAdd {
            key: "p:default:commands_locked".into(),
            score: 1,
            member: "cmd".into(),
        });
        store.eval(&setup).await.unwrap();

        let locked_removal = || {
            let mut txn = Transaction::new();
            txn.expect(
                1,
                Op::ZRem {
                    key: "p:default:commands_locked".into(),
                    member: "cmd".into(),
                },
            );
            txn
        };

        // Two workers race on the same locked command; exactly one wins.
        assert!(store.eval(&locked_removal()).await.unwrap());
        assert!(!store.eval(&locked_removal()).await.unwrap());
    }

    #[tokio::test]
    async fn claim_next_takes_oldest_due_and_locks_it() {
        let store = MemoryStore::new("p:");
        let commands = store.keys().commands("default");

        let mut setup = Transaction::new();
        setup.run(Op::ZAdd {
            key: commands.clone(),
            score: 2,
            member: "second".into(),
        });
        setup.run(Op::ZAdd {
            key: commands.clone(),
            score: 1,
            member: "first".into(),
        });
        store.eval(&setup).await.unwrap();

        assert_eq!(
            store.claim_next("default").await.unwrap().as_deref(),
            Some("first")
        );
        assert_eq!(
            store.claim_next("default").await.unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(store.claim_next("default").await.unwrap(), None);

        let locked = store
            .zset_members(&store.keys().commands_locked("default"))
            .await;
        assert_eq!(locked.len(), 2);
    }

    #[tokio::test]
    async fn claim_next_skips_members_already_locked() {
        let store = MemoryStore::new("p:");
        let commands = store.keys().commands("default");

        let mut setup = Transaction::new();
        setup.run(Op::ZAdd {
            key: commands.clone(),
            score: 1,
            member: "check".into(),
        });
        store.eval(&setup).await.unwrap();

        assert_eq!(
            store.claim_next("default").await.unwrap().as_deref(),
            Some("check")
        );

        // The identical member is enqueued again while the first copy is
        // still locked. It must not be claimable until that lock is gone,
        // otherwise two in-flight copies would merge into one lock entry.
        let mut requeue = Transaction::new();
        requeue.run(Op::ZAdd {
            key: commands.clone(),
            score: 2,
            member: "check".into(),
        });
        store.eval(&requeue).await.unwrap();

        assert_eq!(store.claim_next("default").await.unwrap(), None);

        store.discard_locked("default", "check").await.unwrap();
        assert_eq!(
            store.claim_next("default").await.unwrap().as_deref(),
            Some("check")
        );
    }

    #[tokio::test]
    async fn now_ms_is_monotonic() {
        let store = MemoryStore::new("p:");
        let a = store.now_ms().await.unwrap();
        let b = store.now_ms().await.unwrap();
        let c = store.now_ms().await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn record_write_and_read_through_eval() {
        let store = MemoryStore::new("p:");
        let id = TaskId::generate();
        let uid = crate::domain::TaskUid::generate();
        let key = store.keys().task(&id);

        let record = TaskRecord {
            state: TaskState::Waiting,
            args: vec![],
            children: vec![],
            children_finished: 0,
            total: 1,
            progress: 0,
            result: None,
            error: None,
            pool: "default".into(),
            parent: None,
            remove_delay: 1000,
            name: "noop".into(),
            uid,
            user_data: None,
        };

        let mut txn = Transaction::new();
        for (field, value) in record.encode() {
            txn.run(hset(&key, field, &value));
        }
        store.eval(&txn).await.unwrap();

        let back = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(back.state, TaskState::Waiting);
        assert_eq!(back.name, "noop");
        assert_eq!(back.uid, uid);

        store.remove_task(&id).await;
        assert!(store.get_task(&id).await.unwrap().is_none());
    }
}
