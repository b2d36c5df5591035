//! Task tree construction, templates, and the preparation pipeline.
//!
//! A `Template` is a registered blueprint: the base behavior for its kind
//! plus user-supplied overrides (an `init` hook producing children, a `run`
//! closure for leaves, pool and removal settings). Registration happens once
//! on the queue handle; instantiation happens per task. A `Task` is the
//! in-memory node a submitter builds; nothing touches the store until the
//! whole prepared tree is persisted by `Queue::submit`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::domain::{ParentRef, TaskId, TaskKind, TaskRecord, TaskState, TaskUid};
use crate::error::BraidError;
use crate::queue::Queue;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Leaf work: args in, result or error message out.
pub type RunFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync;

/// Composite hook producing children at preparation time. May be deferred;
/// the preparation pipeline awaits it either way.
pub type InitFn = dyn Fn(Queue) -> BoxFuture<'static, Result<Vec<Task>, BraidError>> + Send + Sync;

/// A registered task blueprint.
#[derive(Clone)]
pub struct Template {
    name: String,
    kind: TaskKind,
    pool: Option<String>,
    remove_delay: Option<i64>,
    /// Progress units a leaf contributes to its ancestors' totals.
    units: u64,
    run: Option<Arc<RunFn>>,
    init: Option<Arc<InitFn>>,
}

impl Template {
    fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            pool: None,
            remove_delay: None,
            units: 1,
            run: None,
            init: None,
        }
    }

    pub fn leaf(name: impl Into<String>) -> Self {
        Self::new(name, TaskKind::Leaf)
    }

    pub fn chain(name: impl Into<String>) -> Self {
        Self::new(name, TaskKind::Chain)
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::new(name, TaskKind::Group)
    }

    /// Leaf work function.
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.run = Some(Arc::new(
            move |args| -> BoxFuture<'static, Result<Value, String>> { Box::pin(f(args)) },
        ));
        self
    }

    /// Children hook for a composite template.
    pub fn init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Queue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Task>, BraidError>> + Send + 'static,
    {
        self.init = Some(Arc::new(
            move |queue| -> BoxFuture<'static, Result<Vec<Task>, BraidError>> {
                Box::pin(f(queue))
            },
        ));
        self
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn remove_delay(mut self, ms: i64) -> Self {
        self.remove_delay = Some(ms);
        self
    }

    pub fn units(mut self, units: u64) -> Self {
        self.units = units;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub(crate) fn run_fn(&self) -> Option<Arc<RunFn>> {
        self.run.clone()
    }

    pub(crate) fn init_fn(&self) -> Option<Arc<InitFn>> {
        self.init.clone()
    }
}

/// Registry of templates, built during queue construction and immutable
/// afterwards. Lookup happens on every dispatched command, registration
/// never races it.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<Template>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: Template) -> Result<(), BraidError> {
        if self.templates.contains_key(template.name()) {
            return Err(BraidError::DuplicateTemplate(template.name().to_string()));
        }
        self.templates
            .insert(template.name().to_string(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Template>> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// An unpersisted task node. Ids are assigned at construction; parent links
/// and totals are filled in by `prepare`.
#[derive(Debug)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) uid: TaskUid,
    pub(crate) name: String,
    pub(crate) kind: TaskKind,
    pub(crate) args: Vec<Value>,
    pub(crate) pool: String,
    pub(crate) remove_delay: i64,
    pub(crate) units: u64,
    pub(crate) user_data: Option<Value>,
    pub(crate) children: Vec<Task>,
    pub(crate) total: u64,
    pub(crate) parent: Option<ParentRef>,
}

impl Task {
    pub(crate) fn from_template(
        template: &Template,
        default_pool: &str,
        default_remove_delay: i64,
        args: Vec<Value>,
        children: Vec<Task>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            uid: TaskUid::generate(),
            name: template.name().to_string(),
            kind: template.kind(),
            args,
            pool: template
                .pool
                .clone()
                .unwrap_or_else(|| default_pool.to_string()),
            remove_delay: template.remove_delay.unwrap_or(default_remove_delay),
            units: template.units,
            user_data: None,
            children,
            total: 0,
            parent: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn user_data(mut self, value: Value) -> Self {
        self.user_data = Some(value);
        self
    }

    /// Depth-first preparation: materialize children through the template's
    /// `init` hook, reject empty composites, stamp parent references, and
    /// sum progress totals up the tree. This is the only phase that mutates
    /// the tree's shape.
    pub(crate) fn prepare<'a>(&'a mut self, queue: &'a Queue) -> BoxFuture<'a, Result<(), BraidError>> {
        Box::pin(async move {
            if !self.kind.is_composite() {
                self.total = self.units;
                return Ok(());
            }

            if self.children.is_empty() {
                if let Some(init) = queue.templates().get(&self.name).and_then(|t| t.init_fn()) {
                    self.children = init(queue.clone()).await?;
                }
            }
            if self.children.is_empty() {
                return Err(BraidError::NoChildren { kind: self.kind });
            }

            let parent_ref = ParentRef {
                id: self.id,
                pool: self.pool.clone(),
                uid: self.uid,
            };

            self.total = 0;
            for child in &mut self.children {
                child.prepare(queue).await?;
                child.parent = Some(parent_ref.clone());
                self.total += child.total;
            }
            Ok(())
        })
    }

    /// The record persisted on first store write. Groups start with an
    /// empty result sequence; chains and leaves with none.
    pub(crate) fn record(&self) -> TaskRecord {
        TaskRecord {
            state: TaskState::Waiting,
            args: self.args.clone(),
            children: self.children.iter().map(|c| c.id).collect(),
            children_finished: 0,
            total: self.total,
            progress: 0,
            result: match self.kind {
                TaskKind::Group => Some(json!([])),
                _ => None,
            },
            error: None,
            pool: self.pool.clone(),
            parent: self.parent.clone(),
            remove_delay: self.remove_delay,
            name: self.name.clone(),
            uid: self.uid,
            user_data: self.user_data.clone(),
        }
    }

    /// All nodes of the tree, depth first, self first.
    pub(crate) fn collect<'a>(&'a self, out: &mut Vec<&'a Task>) {
        out.push(self);
        for child in &self.children {
            child.collect(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = TemplateRegistry::new();
        registry.register(Template::leaf("work")).unwrap();

        let err = registry.register(Template::leaf("work")).unwrap_err();
        assert!(matches!(err, BraidError::DuplicateTemplate(name) if name == "work"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn template_overrides_flow_into_tasks() {
        let template = Template::leaf("work").pool("heavy").remove_delay(5).units(3);
        let task = Task::from_template(&template, "default", 30_000, vec![json!(1)], vec![]);

        assert_eq!(task.pool, "heavy");
        assert_eq!(task.remove_delay, 5);
        assert_eq!(task.units, 3);
        assert_eq!(task.args, vec![json!(1)]);
    }

    #[test]
    fn defaults_apply_when_template_is_silent() {
        let template = Template::group("batch");
        let task = Task::from_template(&template, "default", 30_000, vec![], vec![]);

        assert_eq!(task.pool, "default");
        assert_eq!(task.remove_delay, 30_000);
        assert_eq!(task.kind(), TaskKind::Group);
    }

    #[test]
    fn group_record_starts_with_empty_result_sequence() {
        let group = Template::group("batch");
        let leaf = Template::leaf("work");
        let child = Task::from_template(&leaf, "default", 0, vec![], vec![]);
        let task = Task::from_template(&group, "default", 0, vec![], vec![child]);

        let record = task.record();
        assert_eq!(record.result, Some(json!([])));
        assert_eq!(record.children.len(), 1);
        assert_eq!(record.children_finished, 0);
        assert_eq!(record.state, TaskState::Waiting);
    }

    #[test]
    fn collect_walks_depth_first() {
        let leaf = Template::leaf("work");
        let chain = Template::chain("steps");

        let a = Task::from_template(&leaf, "default", 0, vec![], vec![]);
        let b = Task::from_template(&leaf, "default", 0, vec![], vec![]);
        let inner = Task::from_template(&chain, "default", 0, vec![], vec![a, b]);
        let root = Task::from_template(&chain, "default", 0, vec![], vec![inner]);

        let mut nodes = Vec::new();
        root.collect(&mut nodes);
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].id, root.id);
    }
}
