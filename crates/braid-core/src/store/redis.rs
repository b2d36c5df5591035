//! Redis store implementation.
//!
//! True multi-machine backend: workers on separate hosts share nothing but
//! the Redis instance. Connections come from an r2d2 pool; the transaction
//! contract runs as a server-side Lua script so validate and exec are
//! atomic, and the clock is Redis's own `TIME` so enqueue scores agree
//! across workers.

use async_trait::async_trait;

use super::txn::Transaction;
use super::{decode_record, KeySpace, RawRecord, Store};
use crate::domain::{TaskId, TaskRecord};
use crate::error::BraidError;

/// Interpreter for the validate/exec transaction document.
///
/// Validate ops run in order; the first result that differs from its
/// expected value (under JSON equality) aborts with 0 and no exec op runs.
/// Validate ops themselves may have effects, which is what makes the
/// locked-command removal usable as a fence.
const EVAL_SCRIPT: &str = r#"
local txn = cjson.decode(ARGV[1])
for _, entry in ipairs(txn['validate']) do
    local res = redis.call(unpack(entry[2]))
    if cjson.encode(res) ~= cjson.encode(entry[1]) then
        return 0
    end
end
for _, op in ipairs(txn['exec']) do
    redis.call(unpack(op))
end
return 1
"#;

/// Atomic claim: pop the oldest due command into the locked set. Members
/// already locked are skipped so two copies of an identical canonical
/// command never merge into one lock entry.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 16)
for _, member in ipairs(due) do
    if not redis.call('ZSCORE', KEYS[2], member) then
        redis.call('ZREM', KEYS[1], member)
        redis.call('ZADD', KEYS[2], ARGV[1], member)
        return member
    end
end
return false
"#;

pub struct RedisStore {
    keys: KeySpace,
    pool: r2d2::Pool<redis::Client>,
    eval_script: redis::Script,
    claim_script: redis::Script,
}

impl RedisStore {
    /// Connect with the default pool size.
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self, BraidError> {
        Self::with_pool_size(redis_url, prefix, 16)
    }

    pub fn with_pool_size(
        redis_url: &str,
        prefix: impl Into<String>,
        max_connections: u32,
    ) -> Result<Self, BraidError> {
        let client = redis::Client::open(redis_url)?;
        let pool = r2d2::Pool::builder()
            .max_size(max_connections)
            .build(client)
            .map_err(|e| BraidError::Store(e.to_string()))?;

        Ok(Self {
            keys: KeySpace::new(prefix),
            pool,
            eval_script: redis::Script::new(EVAL_SCRIPT),
            claim_script: redis::Script::new(CLAIM_SCRIPT),
        })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<redis::Client>, BraidError> {
        self.pool.get().map_err(|e| BraidError::Store(e.to_string()))
    }
}

#[async_trait]
impl Store for RedisStore {
    fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn now_ms(&self) -> Result<i64, BraidError> {
        let mut conn = self.conn()?;
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query(&mut *conn)?;
        Ok(secs * 1000 + micros / 1000)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, BraidError> {
        let mut conn = self.conn()?;
        let raw: RawRecord = redis::cmd("HGETALL")
            .arg(self.keys.task(id))
            .query(&mut *conn)?;
        decode_record(raw)
    }

    async fn get_tasks(&self, ids: &[TaskId]) -> Result<Vec<Option<TaskRecord>>, BraidError> {
        let mut conn = self.conn()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: RawRecord = redis::cmd("HGETALL")
                .arg(self.keys.task(id))
                .query(&mut *conn)?;
            out.push(decode_record(raw)?);
        }
        Ok(out)
    }

    async fn eval(&self, txn: &Transaction) -> Result<bool, BraidError> {
        let mut conn = self.conn()?;
        let passed: i64 = self
            .eval_script
            .arg(txn.wire().to_string())
            .invoke(&mut *conn)?;
        Ok(passed == 1)
    }

    async fn claim_next(&self, pool: &str) -> Result<Option<String>, BraidError> {
        let now = self.now_ms().await?;
        let mut conn = self.conn()?;
        let member: Option<String> = self
            .claim_script
            .key(self.keys.commands(pool))
            .key(self.keys.commands_locked(pool))
            .arg(now)
            .invoke(&mut *conn)?;
        Ok(member)
    }

    async fn discard_locked(&self, pool: &str, raw: &str) -> Result<(), BraidError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("ZREM")
            .arg(self.keys.commands_locked(pool))
            .arg(raw)
            .query(&mut *conn)?;
        Ok(())
    }
}
