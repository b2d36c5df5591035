//! Leaf task execution.
//!
//! A leaf's work is its template's `run` closure. The closure may execute
//! more than once under racing workers; the terminal transition cannot.
//! Whatever the closure did, exactly one transaction records the outcome
//! and reports to the parent.

use serde_json::json;
use tracing::debug;

use super::{finish_ops, guarded, notify_parent_result, send_command, set_field, HandlerCtx};
use crate::domain::record::fields;
use crate::domain::{ClaimedCommand, Command, TaskRecord, TaskState};
use crate::error::BraidError;
use crate::events::TaskEvent;
use crate::store::Store;
use crate::task::Template;

/// Run the leaf and commit its terminal transition.
pub(crate) async fn activate(
    ctx: &HandlerCtx,
    template: &Template,
    record: TaskRecord,
    claimed: &ClaimedCommand,
) -> Result<(), BraidError> {
    let id = claimed.command.to;
    if record.state != TaskState::Waiting {
        debug!(%id, state = %record.state.as_str(), "stale activate, discarding");
        return ctx.discard(claimed).await;
    }

    let outcome = match template.run_fn() {
        Some(run) => run(record.args.clone()).await,
        None => Err(format!("template {} has no run function", record.name)),
    };

    let now = ctx.store.now_ms().await?;
    let keys = ctx.keys();
    let mut txn = guarded(keys, claimed, TaskState::Waiting);
    finish_ops(&mut txn, keys, &record, claimed, now);

    match outcome {
        Ok(result) => {
            set_field(&mut txn, keys, &id, fields::PROGRESS, &record.total);
            set_field(&mut txn, keys, &id, fields::RESULT, &result);
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
        }
        Err(message) => {
            let error = json!({ "message": message });
            set_field(&mut txn, keys, &id, fields::ERROR, &error);
            if let Some(parent) = &record.parent {
                let up = Command::error(parent.id, parent.uid, id, error.clone());
                send_command(&mut txn, keys, &parent.pool, &up, now);
            }

            if ctx.store.eval(&txn).await? {
                ctx.events.emit(TaskEvent::ended_err(id, error));
            } else {
                debug!(%id, "lost finish race");
            }
        }
    }
    Ok(())
}
