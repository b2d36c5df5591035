//! Group composite: parallel orchestration.
//!
//! Activation fans `activate` out to every present child in one atomic
//! burst. Each child result only increments `children_finished` and
//! re-enters the group through a `group_check` command; the completion
//! decision happens in that later, separate transaction, against a fresh
//! read of the counter. Folding the decision into the increment would make
//! "am I the last?" depend on the pre-increment counter, which the
//! optimistic validate block cannot express.

use serde_json::{json, Value};
use tracing::debug;

use super::{finish_ops, guarded, notify_parent_result, send_command, set_field, HandlerCtx};
use crate::domain::record::fields;
use crate::domain::{ClaimedCommand, Command, TaskRecord, TaskState};
use crate::error::BraidError;
use crate::events::TaskEvent;
use crate::store::{Op, Store};

/// `waiting -> idle`: activate every currently-present child. Children
/// whose records are gone are skipped.
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
    let children = ctx.store.get_tasks(&record.children).await?;

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

    for (child_id, child) in record.children.iter().zip(children.iter()) {
        if let Some(child) = child {
            let cmd = Command::activate(*child_id, child.uid);
            send_command(&mut txn, keys, &child.pool, &cmd, now);
        }
    }

    if !ctx.store.eval(&txn).await? {
        debug!(%id, "lost activate race");
    }
    Ok(())
}

/// A child finished: count it and schedule a completion check. The check
/// runs as its own command so it sees the post-increment counter.
pub(crate) async fn child_result(
    ctx: &HandlerCtx,
    record: TaskRecord,
    claimed: &ClaimedCommand,
) -> Result<(), BraidError> {
    let id = claimed.command.to;
    if record.state != TaskState::Idle {
        debug!(%id, state = %record.state.as_str(), "result for non-idle group, discarding");
        return ctx.discard(claimed).await;
    }

    let now = ctx.store.now_ms().await?;
    let keys = ctx.keys();

    let mut txn = guarded(keys, claimed, TaskState::Idle);
    txn.run(Op::HIncrBy {
        key: keys.task(&id),
        field: fields::CHILDREN_FINISHED.into(),
        by: 1,
    });
    let check = Command::group_check(id, record.uid);
    send_command(&mut txn, keys, &record.pool, &check, now);

    if !ctx.store.eval(&txn).await? {
        debug!(%id, "lost count race");
    }
    Ok(())
}

/// Completion check. Early checks (not all children counted yet) are
/// ignored without touching state. The terminal check re-reads every child:
/// if any record vanished the group finishes with an error; otherwise it
/// finishes with the children's results in `children` order.
pub(crate) async fn check(
    ctx: &HandlerCtx,
    record: TaskRecord,
    claimed: &ClaimedCommand,
) -> Result<(), BraidError> {
    let id = claimed.command.to;
    if record.state != TaskState::Idle {
        debug!(%id, state = %record.state.as_str(), "check for non-idle group, discarding");
        return ctx.discard(claimed).await;
    }
    if record.children_finished < record.children.len() as u64 {
        debug!(
            %id,
            finished = record.children_finished,
            of = record.children.len(),
            "early group check, ignoring"
        );
        return ctx.discard(claimed).await;
    }

    let now = ctx.store.now_ms().await?;
    let keys = ctx.keys();
    let children = ctx.store.get_tasks(&record.children).await?;

    if children.iter().any(Option::is_none) {
        let error = json!({ "message": "terminating task because children deleted" });
        // The event fires before the transaction is attempted; a worker that
        // then loses the race has announced an error that never persisted.
        ctx.events.emit(TaskEvent::ended_err(id, error.clone()));

        let mut txn = guarded(keys, claimed, TaskState::Idle);
        set_field(&mut txn, keys, &id, fields::ERROR, &error);
        finish_ops(&mut txn, keys, &record, claimed, now);
        if let Some(parent) = &record.parent {
            let up = Command::error(parent.id, parent.uid, id, error);
            send_command(&mut txn, keys, &parent.pool, &up, now);
        }

        if !ctx.store.eval(&txn).await? {
            debug!(%id, "lost error finish race");
        }
        return Ok(());
    }

    let results: Vec<Value> = children
        .into_iter()
        .flatten()
        .map(|child| child.result.unwrap_or(Value::Null))
        .collect();
    let result = Value::Array(results);

    let mut txn = guarded(keys, claimed, TaskState::Idle);
    set_field(&mut txn, keys, &id, fields::RESULT, &result);
    set_field(&mut txn, keys, &id, fields::PROGRESS, &record.total);
    finish_ops(&mut txn, keys, &record, claimed, now);
    notify_parent_result(
        &mut txn,
        keys,
        record.parent.as_ref(),
        id,
        Some(result.clone()),
        now,
    );

    if ctx.store.eval(&txn).await? {
        ctx.events.emit(TaskEvent::ended_ok(id, Some(result)));
    } else {
        debug!(%id, "lost finish race");
    }
    Ok(())
}
