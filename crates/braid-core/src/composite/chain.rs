//! Chain composite: sequential orchestration.
//!
//! Children run one at a time, strictly in list order. Each completing
//! child's result is appended to the next child's persisted args inside the
//! same transaction that advances the chain, so the feed and the advance
//! are indivisible. At most one child is ever active.

use serde_json::Value;
use tracing::debug;

use super::{finish_ops, guarded, notify_parent_result, send_command, set_field, HandlerCtx};
use crate::domain::record::fields;
use crate::domain::{ClaimedCommand, Command, TaskRecord, TaskState};
use crate::error::BraidError;
use crate::events::TaskEvent;
use crate::store::{Op, Store};

/// `waiting -> idle`: activate the first child.
///
/// If the first child's record has been deleted between scheduling and now,
/// its activation is simply omitted and the chain still advances.
pub(crate) async fn activate(
    ctx: &HandlerCtx,
    record: TaskRecord,
    claimed: &ClaimedCommand,
) -> Result<(), BraidError> {
    let id = claimed.command.to;
    if record.state != TaskState::Waiting {
        debug!(%id, state = %record.state.as_str(), "stale activate, discarding");
        return ctx.discard(claimed).await;
    }

    let now = ctx.store.now_ms().await?;
    let keys = ctx.keys();

    let mut txn = guarded(keys, claimed, TaskState::Waiting);
    set_field(&mut txn, keys, &id, fields::STATE, &TaskState::Idle);
    txn.run(Op::SRem {
        key: keys.state_set(TaskState::Waiting),
        member: id.to_string(),
    });
    txn.run(Op::SAdd {
        key: keys.state_set(TaskState::Idle),
        member: id.to_string(),
    });

    if let Some(first_id) = record.children.first() {
        if let Some(first) = ctx.store.get_task(first_id).await? {
            let cmd = Command::activate(*first_id, first.uid);
            send_command(&mut txn, keys, &first.pool, &cmd, now);
        }
    }

    if !ctx.store.eval(&txn).await? {
        debug!(%id, "lost activate race");
    }
    Ok(())
}

/// A child finished. Feed its result into the next child and activate it,
/// or finish the chain when the last child reported.
pub(crate) async fn child_result(
    ctx: &HandlerCtx,
    record: TaskRecord,
    claimed: &ClaimedCommand,
) -> Result<(), BraidError> {
    let id = claimed.command.to;
    if record.state != TaskState::Idle {
        debug!(%id, state = %record.state.as_str(), "result for non-idle chain, discarding");
        return ctx.discard(claimed).await;
    }

    let result = claimed.command.result_value().cloned();
    let next_index = (record.children_finished + 1) as usize;
    let now = ctx.store.now_ms().await?;
    let keys = ctx.keys();

    let mut txn = guarded(keys, claimed, TaskState::Idle);
    txn.run(Op::HIncrBy {
        key: keys.task(&id),
        field: fields::CHILDREN_FINISHED.into(),
        by: 1,
    });

    if next_index < record.children.len() {
        let next_id = record.children[next_index];
        // A deleted next child skips the emission; the chain still advances.
        if let Some(next) = ctx.store.get_task(&next_id).await? {
            let mut args = next.args;
            args.push(result.clone().unwrap_or(Value::Null));
            set_field(&mut txn, keys, &next_id, fields::ARGS, &args);
            let cmd = Command::activate(next_id, next.uid);
            send_command(&mut txn, keys, &next.pool, &cmd, now);
        }

        if !ctx.store.eval(&txn).await? {
            debug!(%id, "lost advance race");
        }
        return Ok(());
    }

    // Last child reported: finish, and hand the chain's result (the last
    // child's result) to the parent if there is one.
    set_field(&mut txn, keys, &id, fields::PROGRESS, &record.total);
    if let Some(result) = &result {
        set_field(&mut txn, keys, &id, fields::RESULT, result);
    }
    finish_ops(&mut txn, keys, &record, claimed, now);
    notify_parent_result(&mut txn, keys, record.parent.as_ref(), id, result.clone(), now);

    if ctx.store.eval(&txn).await? {
        ctx.events.emit(TaskEvent::ended_ok(id, result));
    } else {
        debug!(%id, "lost finish race");
    }
    Ok(())
}
