//! Command handlers for composite and leaf tasks.
//!
//! Every handler follows the same discipline: read the target record once,
//! decide the transition, assemble exactly one transaction whose first
//! validate entry removes the claimed command from `commands_locked`
//! (expecting 1) and whose second pins the record's state, then submit it.
//! A failed validation means another worker won the race; the loser returns
//! silently because the winner has already effected the transition.

pub(crate) mod chain;
pub(crate) mod group;
pub(crate) mod leaf;

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::domain::record::fields;
use crate::domain::{ClaimedCommand, Command, CommandType, ParentRef, TaskKind, TaskRecord, TaskState};
use crate::error::BraidError;
use crate::events::{EventBus, TaskEvent};
use crate::store::{KeySpace, Op, Store, Transaction};
use crate::task::Template;

/// Everything a handler needs besides the record and the command.
#[derive(Clone)]
pub(crate) struct HandlerCtx {
    pub store: Arc<dyn Store>,
    pub events: EventBus,
}

impl HandlerCtx {
    fn keys(&self) -> &KeySpace {
        self.store.keys()
    }

    /// Consume the claim without effecting any transition.
    async fn discard(&self, claimed: &ClaimedCommand) -> Result<(), BraidError> {
        self.store
            .discard_locked(&claimed.pool, &claimed.raw)
            .await
    }
}

/// Route one claimed command to the handler for its target's kind. The
/// record was freshly read by the caller; stale or mismatched commands are
/// discarded here.
pub(crate) async fn dispatch(
    ctx: &HandlerCtx,
    template: &Template,
    record: TaskRecord,
    claimed: &ClaimedCommand,
) -> Result<(), BraidError> {
    match (template.kind(), claimed.command.kind) {
        (TaskKind::Leaf, CommandType::Activate) => leaf::activate(ctx, template, record, claimed).await,
        (TaskKind::Chain, CommandType::Activate) => chain::activate(ctx, record, claimed).await,
        (TaskKind::Chain, CommandType::Result) => chain::child_result(ctx, record, claimed).await,
        (TaskKind::Group, CommandType::Activate) => group::activate(ctx, record, claimed).await,
        (TaskKind::Group, CommandType::Result) => group::child_result(ctx, record, claimed).await,
        (TaskKind::Group, CommandType::GroupCheck) => group::check(ctx, record, claimed).await,
        (TaskKind::Chain, CommandType::Error) | (TaskKind::Group, CommandType::Error) => {
            child_error(ctx, record, claimed).await
        }
        (kind, command) => {
            warn!(%kind, ?command, "command does not apply to task kind, discarding");
            ctx.discard(claimed).await
        }
    }
}

/// Start a transaction guarded by the claimed command's lock removal and
/// the record's current state.
pub(crate) fn guarded(
    keys: &KeySpace,
    claimed: &ClaimedCommand,
    state: TaskState,
) -> Transaction {
    let mut txn = Transaction::new();
    txn.expect(
        1,
        Op::ZRem {
            key: keys.commands_locked(&claimed.pool),
            member: claimed.raw.clone(),
        },
    );
    txn.expect(
        state.encoded(),
        Op::HGet {
            key: keys.task(&claimed.command.to),
            field: fields::STATE.into(),
        },
    );
    txn
}

/// Terminal bookkeeping: flip the state field, drop the id from its old
/// state set, and score it into `finished` by its removal deadline.
pub(crate) fn finish_ops(
    txn: &mut Transaction,
    keys: &KeySpace,
    record: &TaskRecord,
    claimed: &ClaimedCommand,
    now: i64,
) {
    let id = claimed.command.to;
    let task_key = keys.task(&id);
    txn.run(Op::HSet {
        key: task_key,
        field: fields::STATE.into(),
        value: TaskState::Finished.encoded(),
    });
    txn.run(Op::SRem {
        key: keys.state_set(record.state),
        member: id.to_string(),
    });
    txn.run(Op::ZAdd {
        key: keys.state_set(TaskState::Finished),
        score: now + record.remove_delay,
        member: id.to_string(),
    });
}

/// Enqueue a command on a pool, scored by the store clock.
pub(crate) fn send_command(
    txn: &mut Transaction,
    keys: &KeySpace,
    pool: &str,
    command: &Command,
    now: i64,
) {
    txn.run(Op::ZAdd {
        key: keys.commands(pool),
        score: now,
        member: command.canonical(),
    });
}

pub(crate) fn set_field<T: serde::Serialize>(
    txn: &mut Transaction,
    keys: &KeySpace,
    id: &crate::domain::TaskId,
    field: &str,
    value: &T,
) {
    txn.run(Op::HSet {
        key: keys.task(id),
        field: field.into(),
        value: serde_json::to_string(value).expect("record field serialization is infallible"),
    });
}

/// A child reported failure. Chains and groups surface it the same way:
/// persist the error, finish, and pass the error upward if there is a
/// parent.
pub(crate) async fn child_error(
    ctx: &HandlerCtx,
    record: TaskRecord,
    claimed: &ClaimedCommand,
) -> Result<(), BraidError> {
    let id = claimed.command.to;
    if record.state.is_terminal() {
        debug!(%id, "error for finished task, discarding");
        return ctx.discard(claimed).await;
    }

    let error = claimed
        .command
        .error_value()
        .cloned()
        .unwrap_or_else(|| json!({ "message": "child task failed" }));

    let now = ctx.store.now_ms().await?;
    let keys = ctx.keys();
    let mut txn = guarded(keys, claimed, record.state);
    set_field(&mut txn, keys, &id, fields::ERROR, &error);
    finish_ops(&mut txn, keys, &record, claimed, now);
    if let Some(parent) = &record.parent {
        let up = Command::error(parent.id, parent.uid, id, error.clone());
        send_command(&mut txn, keys, &parent.pool, &up, now);
    }

    if ctx.store.eval(&txn).await? {
        ctx.events.emit(TaskEvent::ended_err(id, error));
    } else {
        debug!(%id, "lost error transition race");
    }
    Ok(())
}

/// Emit a terminal `result` to the parent, when there is one.
pub(crate) fn notify_parent_result(
    txn: &mut Transaction,
    keys: &KeySpace,
    parent: Option<&ParentRef>,
    from: crate::domain::TaskId,
    result: Option<Value>,
    now: i64,
) {
    if let Some(parent) = parent {
        let up = Command::result(parent.id, parent.uid, from, result);
        send_command(txn, keys, &parent.pool, &up, now);
    }
}
