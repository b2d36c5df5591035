//! Host-facing queue handle.
//!
//! The handle is cheap to clone and carries no task state of its own: the
//! store holds everything durable, the handle holds the store connection,
//! the template registry, and the event bus. Templates are registered at
//! build time and immutable afterwards.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::composite::HandlerCtx;
use crate::domain::{Command, TaskId, TaskState};
use crate::error::BraidError;
use crate::events::{EventBus, TaskEvent};
use crate::store::{Op, Store, Transaction};
use crate::task::{Task, Template, TemplateRegistry};

const DEFAULT_POOL: &str = "default";
const DEFAULT_REMOVE_DELAY_MS: i64 = 30_000;

struct QueueInner {
    store: Arc<dyn Store>,
    templates: TemplateRegistry,
    chain_template: Arc<Template>,
    group_template: Arc<Template>,
    events: EventBus,
    default_pool: String,
    default_remove_delay: i64,
}

#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

pub struct QueueBuilder {
    store: Arc<dyn Store>,
    templates: TemplateRegistry,
    default_pool: String,
    default_remove_delay: i64,
}

impl QueueBuilder {
    fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            templates: TemplateRegistry::new(),
            default_pool: DEFAULT_POOL.to_string(),
            default_remove_delay: DEFAULT_REMOVE_DELAY_MS,
        }
    }

    /// Pool tasks land on when their template names none.
    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.default_pool = pool.into();
        self
    }

    /// How long finished records linger before the janitor may remove them.
    pub fn remove_delay(mut self, ms: i64) -> Self {
        self.default_remove_delay = ms;
        self
    }

    /// Register a template. Duplicate names fail fast at build time rather
    /// than at dispatch.
    pub fn register(mut self, template: Template) -> Result<Self, BraidError> {
        self.templates.register(template)?;
        Ok(self)
    }

    pub fn build(mut self) -> Result<Queue, BraidError> {
        // Built-in anonymous composites back `queue.chain` / `queue.group`.
        // A user template may not shadow them.
        let chain_template = Arc::new(Template::chain("chain"));
        let group_template = Arc::new(Template::group("group"));
        self.templates.register((*chain_template).clone())?;
        self.templates.register((*group_template).clone())?;

        Ok(Queue {
            inner: Arc::new(QueueInner {
                store: self.store,
                templates: self.templates,
                chain_template,
                group_template,
                events: EventBus::default(),
                default_pool: self.default_pool,
                default_remove_delay: self.default_remove_delay,
            }),
        })
    }
}

impl Queue {
    pub fn builder(store: Arc<dyn Store>) -> QueueBuilder {
        QueueBuilder::new(store)
    }

    /// A chain running `children` sequentially, feeding each child's result
    /// into the next child's argument list.
    pub fn chain(&self, children: Vec<Task>) -> Task {
        Task::from_template(
            &self.inner.chain_template,
            &self.inner.default_pool,
            self.inner.default_remove_delay,
            vec![],
            children,
        )
    }

    /// A group running `children` concurrently, collecting their results as
    /// an ordered sequence.
    pub fn group(&self, children: Vec<Task>) -> Task {
        Task::from_template(
            &self.inner.group_template,
            &self.inner.default_pool,
            self.inner.default_remove_delay,
            vec![],
            children,
        )
    }

    /// Instantiate a registered template.
    pub fn task(&self, name: &str, args: Vec<Value>) -> Result<Task, BraidError> {
        let template = self
            .inner
            .templates
            .get(name)
            .ok_or_else(|| BraidError::TemplateNotFound(name.to_string()))?;
        Ok(Task::from_template(
            template,
            &self.inner.default_pool,
            self.inner.default_remove_delay,
            args,
            vec![],
        ))
    }

    /// Prepare and persist a task tree, then activate its root.
    ///
    /// Preparation failures (a composite with no children, a failing `init`
    /// hook) surface before anything is written: the tree is persisted in
    /// one atomic transaction together with the root's `activate` command.
    pub async fn submit(&self, mut task: Task) -> Result<TaskId, BraidError> {
        task.prepare(self).await?;

        let store = &self.inner.store;
        let keys = store.keys();
        let now = store.now_ms().await?;

        let mut nodes = Vec::new();
        task.collect(&mut nodes);

        let mut txn = Transaction::new();
        for node in &nodes {
            let key = keys.task(&node.id);
            for (field, value) in node.record().encode() {
                txn.run(Op::HSet {
                    key: key.clone(),
                    field: field.into(),
                    value,
                });
            }
            txn.run(Op::SAdd {
                key: keys.state_set(TaskState::Waiting),
                member: node.id.to_string(),
            });
        }

        let activate = Command::activate(task.id, task.uid);
        txn.run(Op::ZAdd {
            key: keys.commands(&task.pool),
            score: now,
            member: activate.canonical(),
        });

        if !store.eval(&txn).await? {
            return Err(BraidError::Store("submission transaction rejected".into()));
        }

        info!(id = %task.id, kind = %task.kind, nodes = nodes.len(), "task submitted");
        Ok(task.id)
    }

    /// Subscribe to terminal events. Subscribe before submitting to be sure
    /// not to miss a fast task's end.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Wait on an existing subscription until `id` ends.
    pub async fn wait(
        &self,
        rx: &mut broadcast::Receiver<TaskEvent>,
        id: TaskId,
    ) -> Result<TaskEvent, BraidError> {
        loop {
            match rx.recv().await {
                Ok(event) if event.id == id => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BraidError::Other("event bus closed".into()))
                }
            }
        }
    }

    pub fn default_pool(&self) -> &str {
        &self.inner.default_pool
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub(crate) fn templates(&self) -> &TemplateRegistry {
        &self.inner.templates
    }

    pub(crate) fn handler_ctx(&self) -> HandlerCtx {
        HandlerCtx {
            store: Arc::clone(&self.inner.store),
            events: self.inner.events.clone(),
        }
    }
}
