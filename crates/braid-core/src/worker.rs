//! Worker group: claims commands off pool queues and routes them to task
//! handlers.
//!
//! Workers are stateless. Each iteration claims one command, re-reads the
//! target record, applies the uid fence, and dispatches. A handler that
//! returns without error has consumed its claim (through its transaction's
//! validate removal or an explicit discard); nothing is ever re-enqueued on
//! a non-error return.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::composite;
use crate::domain::ClaimedCommand;
use crate::error::BraidError;
use crate::queue::Queue;
use crate::store::Store;

/// Worker group handle.
/// - `request_shutdown` stops taking new claims; in-flight handlers finish.
/// - `join` waits for all workers to exit.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers consuming the given pools.
    pub fn spawn(n: usize, queue: Queue, pools: Vec<String>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let queue = queue.clone();
            let pools = pools.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, queue, pools, &mut rx).await;
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Queue,
    pools: Vec<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let mut claimed_any = false;
        for pool in &pools {
            match step(&queue, pool).await {
                Ok(true) => claimed_any = true,
                Ok(false) => {}
                Err(e) => warn!(worker_id, %pool, error = %e, "command processing failed"),
            }
        }

        if !claimed_any {
            // Nothing due anywhere; back off briefly but stay responsive to
            // shutdown.
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

/// Claim and process at most one command from `pool`. Returns whether a
/// command was claimed. Exposed for tests that need to drive command
/// processing one step at a time.
pub async fn step(queue: &Queue, pool: &str) -> Result<bool, BraidError> {
    let store = queue.store();
    let Some(raw) = store.claim_next(pool).await? else {
        return Ok(false);
    };

    let claimed = match ClaimedCommand::new(pool, raw.clone()) {
        Ok(claimed) => claimed,
        Err(e) => {
            warn!(%pool, error = %e, "unparseable command, discarding");
            store.discard_locked(pool, &raw).await?;
            return Ok(true);
        }
    };

    let Some(record) = store.get_task(&claimed.command.to).await? else {
        debug!(to = %claimed.command.to, "target record missing, discarding");
        store.discard_locked(pool, &raw).await?;
        return Ok(true);
    };

    // uid fence: a resurrected task at the same id carries a new uid, so
    // commands meant for its predecessor die here.
    if record.uid != claimed.command.to_uid {
        debug!(to = %claimed.command.to, "uid fence rejected command, discarding");
        store.discard_locked(pool, &raw).await?;
        return Ok(true);
    }

    let Some(template) = queue.templates().get(&record.name).cloned() else {
        warn!(name = %record.name, "no template registered for task, discarding");
        store.discard_locked(pool, &raw).await?;
        return Ok(true);
    };

    let ctx = queue.handler_ctx();
    composite::dispatch(&ctx, &template, record, &claimed).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Command, CommandType, TaskState, TaskUid};
    use crate::store::{MemoryStore, Op, Transaction};
    use crate::task::Template;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::time::timeout;

    const POOL: &str = "default";

    fn echo_template() -> Template {
        // Result is the first argument, so feeds are easy to observe.
        Template::leaf("echo")
            .run(|args| async move { Ok(args.into_iter().next().unwrap_or(Value::Null)) })
    }

    fn test_queue(store: Arc<MemoryStore>) -> Queue {
        Queue::builder(store as Arc<dyn Store>)
            .register(Template::leaf("seven").run(|_| async { Ok(json!(7)) }))
            .unwrap()
            .register(Template::leaf("add_one").run(|args| async move {
                let last = args
                    .last()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| "missing numeric argument".to_string())?;
                Ok(json!(last + 1))
            }))
            .unwrap()
            .register(echo_template())
            .unwrap()
            .register(Template::leaf("fail").run(|_| async { Err("boom".to_string()) }))
            .unwrap()
            .build()
            .unwrap()
    }

    async fn drain(queue: &Queue) -> usize {
        let mut steps = 0;
        while step(queue, POOL).await.unwrap() {
            steps += 1;
        }
        steps
    }

    #[tokio::test]
    async fn two_step_chain_feeds_the_first_result_into_the_second() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let a = queue.task("seven", vec![]).unwrap();
        let b = queue.task("add_one", vec![]).unwrap();
        let b_id = b.id();
        let chain = queue.chain(vec![a, b]);
        let chain_id = chain.id();

        let mut rx = queue.subscribe();
        queue.submit(chain).await.unwrap();

        let workers = WorkerGroup::spawn(2, queue.clone(), vec![POOL.to_string()]);
        let event = timeout(Duration::from_secs(5), queue.wait(&mut rx, chain_id))
            .await
            .expect("chain should finish")
            .unwrap();
        workers.shutdown_and_join().await;

        assert_eq!(event.result, Some(json!(8)));
        assert!(!event.is_error());

        // The feed is persisted: the second child's args grew by the first
        // child's result.
        let b_record = store.get_task(&b_id).await.unwrap().unwrap();
        assert_eq!(b_record.args, vec![json!(7)]);

        let chain_record = store.get_task(&chain_id).await.unwrap().unwrap();
        assert_eq!(chain_record.state, TaskState::Finished);
        assert_eq!(chain_record.children_finished, 2);
        assert_eq!(chain_record.progress, chain_record.total);
        assert_eq!(chain_record.result, Some(json!(8)));
    }

    #[tokio::test]
    async fn group_of_three_collects_results_in_children_order() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let group = queue.group(vec![
            queue.task("echo", vec![json!("a")]).unwrap(),
            queue.task("echo", vec![json!("b")]).unwrap(),
            queue.task("echo", vec![json!("c")]).unwrap(),
        ]);
        let group_id = group.id();

        let mut rx = queue.subscribe();
        queue.submit(group).await.unwrap();
        drain(&queue).await;

        let record = store.get_task(&group_id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Finished);
        assert_eq!(record.result, Some(json!(["a", "b", "c"])));
        assert_eq!(record.children_finished, 3);

        // Exactly one end event for the group, regardless of how many
        // checks were scheduled along the way.
        let mut group_events = 0;
        while let Ok(event) = rx.try_recv() {
            if event.id == group_id {
                group_events += 1;
                assert_eq!(event.result, Some(json!(["a", "b", "c"])));
            }
        }
        assert_eq!(group_events, 1);
    }

    #[tokio::test]
    async fn nested_chain_of_groups_feeds_group_results_across() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let first = queue.group(vec![
            queue.task("echo", vec![json!(1)]).unwrap(),
            queue.task("echo", vec![json!(2)]).unwrap(),
        ]);
        let second = queue.group(vec![queue.task("echo", vec![json!(3)]).unwrap()]);
        let second_id = second.id();

        let chain = queue.chain(vec![first, second]);
        let chain_id = chain.id();

        let mut rx = queue.subscribe();
        queue.submit(chain).await.unwrap();

        let workers = WorkerGroup::spawn(3, queue.clone(), vec![POOL.to_string()]);
        let event = timeout(Duration::from_secs(5), queue.wait(&mut rx, chain_id))
            .await
            .expect("nested chain should finish")
            .unwrap();
        workers.shutdown_and_join().await;

        // The outer chain's result is the last group's result.
        assert_eq!(event.result, Some(json!([3])));

        // The first group's gathered result arrived as the second group's
        // appended argument.
        let second_record = store.get_task(&second_id).await.unwrap().unwrap();
        assert_eq!(second_record.args, vec![json!([1, 2])]);
    }

    #[tokio::test]
    async fn racing_workers_on_one_activate_advance_exactly_once() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let child = queue.task("seven", vec![]).unwrap();
        let child_id = child.id();
        let chain = queue.chain(vec![child]);
        let chain_id = chain.id();
        queue.submit(chain).await.unwrap();

        // Both "workers" share one claim and one pre-race snapshot of the
        // record, the worst interleaving the optimistic validate must
        // survive.
        let raw = store.claim_next(POOL).await.unwrap().unwrap();
        let claimed = ClaimedCommand::new(POOL, raw).unwrap();
        let record = store.get_task(&chain_id).await.unwrap().unwrap();
        let template = queue.templates().get("chain").cloned().unwrap();
        let ctx = queue.handler_ctx();

        composite::dispatch(&ctx, &template, record.clone(), &claimed)
            .await
            .unwrap();
        // The loser must return silently without touching anything.
        composite::dispatch(&ctx, &template, record, &claimed)
            .await
            .unwrap();

        let chain_record = store.get_task(&chain_id).await.unwrap().unwrap();
        assert_eq!(chain_record.state, TaskState::Idle);

        // The first child was activated exactly once.
        let pending = store.zset_members(&store.keys().commands(POOL)).await;
        assert_eq!(pending.len(), 1);
        let cmd = Command::parse(&pending[0].1).unwrap();
        assert_eq!(cmd.to, child_id);
        assert_eq!(cmd.kind, CommandType::Activate);

        // And the lock is fully consumed.
        let locked = store
            .zset_members(&store.keys().commands_locked(POOL))
            .await;
        assert!(locked.is_empty());
    }

    #[tokio::test]
    async fn group_with_deleted_child_finishes_with_error_and_tells_parent() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let doomed = queue.task("echo", vec![json!("b")]).unwrap();
        let doomed_id = doomed.id();
        let group = queue.group(vec![queue.task("echo", vec![json!("a")]).unwrap(), doomed]);
        let group_id = group.id();
        let tail = queue.task("echo", vec![json!("tail")]).unwrap();
        let tail_id = tail.id();
        let chain = queue.chain(vec![group, tail]);
        let chain_id = chain.id();

        let mut rx = queue.subscribe();
        queue.submit(chain).await.unwrap();

        // Process everything up to the final group check: both children
        // report, then one child's record is yanked before the check runs.
        loop {
            let pending = store.zset_members(&store.keys().commands(POOL)).await;
            if pending.len() == 1 {
                let cmd = Command::parse(&pending[0].1).unwrap();
                if cmd.kind == CommandType::GroupCheck && cmd.to == group_id {
                    break;
                }
            }
            assert!(step(&queue, POOL).await.unwrap(), "ran out of commands");
        }
        store.remove_task(&doomed_id).await;
        drain(&queue).await;

        let group_record = store.get_task(&group_id).await.unwrap().unwrap();
        assert_eq!(group_record.state, TaskState::Finished);
        assert_eq!(
            group_record.error,
            Some(json!({ "message": "terminating task because children deleted" }))
        );
        assert_eq!(group_record.children_finished, 2);

        // The parent chain received `error`, not `result`: it is finished,
        // carries the error, and never activated its second child.
        let chain_record = store.get_task(&chain_id).await.unwrap().unwrap();
        assert_eq!(chain_record.state, TaskState::Finished);
        assert_eq!(chain_record.error, group_record.error);
        let tail_record = store.get_task(&tail_id).await.unwrap().unwrap();
        assert_eq!(tail_record.state, TaskState::Waiting);

        let group_event = queue.wait(&mut rx, group_id).await.unwrap();
        assert!(group_event.is_error());
        let chain_event = queue.wait(&mut rx, chain_id).await.unwrap();
        assert!(chain_event.is_error());
    }

    #[tokio::test]
    async fn chain_child_deleted_before_activation_still_advances() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let first = queue.task("seven", vec![]).unwrap();
        let doomed = queue.task("add_one", vec![]).unwrap();
        let doomed_id = doomed.id();
        let chain = queue.chain(vec![first, doomed]);
        let chain_id = chain.id();
        queue.submit(chain).await.unwrap();

        // chain activate, then the first leaf.
        assert!(step(&queue, POOL).await.unwrap());
        assert!(step(&queue, POOL).await.unwrap());

        store.remove_task(&doomed_id).await;
        drain(&queue).await;

        // The advance happened (one child counted) but no activate went out
        // to the deleted child; the chain sits idle rather than crashing.
        let chain_record = store.get_task(&chain_id).await.unwrap().unwrap();
        assert_eq!(chain_record.state, TaskState::Idle);
        assert_eq!(chain_record.children_finished, 1);
        let pending = store.zset_members(&store.keys().commands(POOL)).await;
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn leaf_failure_propagates_up_the_chain() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let failing = queue.task("fail", vec![]).unwrap();
        let never_runs = queue.task("seven", vec![]).unwrap();
        let never_runs_id = never_runs.id();
        let chain = queue.chain(vec![failing, never_runs]);
        let chain_id = chain.id();

        let mut rx = queue.subscribe();
        queue.submit(chain).await.unwrap();
        drain(&queue).await;

        let chain_record = store.get_task(&chain_id).await.unwrap().unwrap();
        assert_eq!(chain_record.state, TaskState::Finished);
        assert_eq!(chain_record.error, Some(json!({ "message": "boom" })));
        assert_eq!(chain_record.children_finished, 0);

        let untouched = store.get_task(&never_runs_id).await.unwrap().unwrap();
        assert_eq!(untouched.state, TaskState::Waiting);

        let event = queue.wait(&mut rx, chain_id).await.unwrap();
        assert!(event.is_error());
    }

    #[tokio::test]
    async fn uid_fence_drops_commands_for_a_replaced_task() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let task = queue.task("seven", vec![]).unwrap();
        let id = task.id();
        queue.submit(queue.chain(vec![task])).await.unwrap();

        // A command addressed with a stale uid, as if the task at this id
        // had been replaced since the command was scheduled.
        let stale = Command::activate(id, TaskUid::generate());
        let mut txn = Transaction::new();
        txn.run(Op::ZAdd {
            key: store.keys().commands(POOL),
            score: 0,
            member: stale.canonical(),
        });
        store.eval(&txn).await.unwrap();

        assert!(step(&queue, POOL).await.unwrap());

        // Dropped outright: the leaf never ran and nothing stayed locked.
        let record = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Waiting);
        let locked = store
            .zset_members(&store.keys().commands_locked(POOL))
            .await;
        assert!(locked.is_empty());
    }

    #[tokio::test]
    async fn repeated_delivery_effects_the_transition_at_most_once() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store.clone());

        let chain = queue.chain(vec![queue.task("seven", vec![]).unwrap()]);
        let chain_id = chain.id();
        queue.submit(chain).await.unwrap();

        // Duplicate the root activate before anything runs.
        let pending = store.zset_members(&store.keys().commands(POOL)).await;
        let duplicate = pending[0].1.clone();
        assert!(step(&queue, POOL).await.unwrap());

        let mut txn = Transaction::new();
        txn.run(Op::ZAdd {
            key: store.keys().commands(POOL),
            score: 0,
            member: duplicate,
        });
        store.eval(&txn).await.unwrap();
        drain(&queue).await;

        // The duplicate was discarded as stale; the chain finished normally.
        let record = store.get_task(&chain_id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Finished);
        assert_eq!(record.children_finished, 1);
        assert_eq!(record.result, Some(json!(7)));
    }

    #[tokio::test]
    async fn workers_shut_down_cleanly() {
        let store = Arc::new(MemoryStore::new("braid:"));
        let queue = test_queue(store);

        let workers = WorkerGroup::spawn(2, queue, vec![POOL.to_string()]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        timeout(Duration::from_secs(1), workers.shutdown_and_join())
            .await
            .expect("workers should stop promptly");
    }
}
