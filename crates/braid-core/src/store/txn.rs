//! Optimistic transaction model: validate-then-execute, evaluated atomically
//! by the store-side script.
//!
//! A transaction is `{validate: [[expected, op], ...], exec: [op, ...]}`.
//! The script runs each validate op in order and compares its result to the
//! expected value under JSON equality; only if every comparison passes does
//! it run the exec ops. Validate ops may have effects (the locked-command
//! removal is one), which is exactly what makes the removal count usable as
//! a fence: two racing workers cannot both remove the same member.

use serde_json::Value;

/// One store operation. `HGet` is the only pure read; the rest are writes,
/// and `ZRem` doubles as the locking validate.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    ZAdd { key: String, score: i64, member: String },
    ZRem { key: String, member: String },
    HSet { key: String, field: String, value: String },
    HIncrBy { key: String, field: String, by: i64 },
    HGet { key: String, field: String },
}

impl Op {
    /// The `[cmd, ...args]` array form of the script ABI.
    pub fn wire(&self) -> Value {
        match self {
            Op::SAdd { key, member } => wire_args("SADD", &[key, member]),
            Op::SRem { key, member } => wire_args("SREM", &[key, member]),
            Op::ZAdd { key, score, member } => Value::Array(vec![
                Value::from("ZADD"),
                Value::from(key.as_str()),
                Value::from(*score),
                Value::from(member.as_str()),
            ]),
            Op::ZRem { key, member } => wire_args("ZREM", &[key, member]),
            Op::HSet { key, field, value } => wire_args("HSET", &[key, field, value]),
            Op::HIncrBy { key, field, by } => Value::Array(vec![
                Value::from("HINCRBY"),
                Value::from(key.as_str()),
                Value::from(field.as_str()),
                Value::from(*by),
            ]),
            Op::HGet { key, field } => wire_args("HGET", &[key, field]),
        }
    }
}

fn wire_args(cmd: &str, args: &[&String]) -> Value {
    let mut out = vec![Value::from(cmd)];
    out.extend(args.iter().map(|a| Value::from(a.as_str())));
    Value::Array(out)
}

/// A validate entry: run `op`, require its result to equal `expected`.
#[derive(Debug, Clone)]
pub struct Expect {
    pub expected: Value,
    pub op: Op,
}

#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub validate: Vec<Expect>,
    pub exec: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a validate entry. Callers put the locked-command removal
    /// first, expecting `1`.
    pub fn expect(&mut self, expected: impl Into<Value>, op: Op) -> &mut Self {
        self.validate.push(Expect {
            expected: expected.into(),
            op,
        });
        self
    }

    pub fn run(&mut self, op: Op) -> &mut Self {
        self.exec.push(op);
        self
    }

    /// The single JSON document handed to the store-side script.
    pub fn wire(&self) -> Value {
        let validate: Vec<Value> = self
            .validate
            .iter()
            .map(|e| Value::Array(vec![e.expected.clone(), e.op.wire()]))
            .collect();
        let exec: Vec<Value> = self.exec.iter().map(Op::wire).collect();
        serde_json::json!({ "validate": validate, "exec": exec })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_document_matches_script_abi() {
        let mut txn = Transaction::new();
        txn.expect(
            1,
            Op::ZRem {
                key: "p:default:commands_locked".into(),
                member: "{}".into(),
            },
        );
        txn.expect(
            "\"waiting\"",
            Op::HGet {
                key: "p:t-1".into(),
                field: "state".into(),
            },
        );
        txn.run(Op::HSet {
            key: "p:t-1".into(),
            field: "state".into(),
            value: "\"idle\"".into(),
        });
        txn.run(Op::ZAdd {
            key: "p:default:commands".into(),
            score: 42,
            member: "{}".into(),
        });

        assert_eq!(
            txn.wire(),
            json!({
                "validate": [
                    [1, ["ZREM", "p:default:commands_locked", "{}"]],
                    ["\"waiting\"", ["HGET", "p:t-1", "state"]],
                ],
                "exec": [
                    ["HSET", "p:t-1", "state", "\"idle\""],
                    ["ZADD", "p:default:commands", 42, "{}"],
                ],
            })
        );
    }

    #[test]
    fn hincrby_carries_numeric_delta() {
        let op = Op::HIncrBy {
            key: "k".into(),
            field: "children_finished".into(),
            by: 1,
        };
        assert_eq!(op.wire(), json!(["HINCRBY", "k", "children_finished", 1]));
    }
}
