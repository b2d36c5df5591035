//! braid-core
//!
//! Composite task engine for a distributed, persistent job queue. Durable
//! state lives in an external key/value store with atomic script
//! evaluation; workers coordinate through commands on pool queues and an
//! optimistic validate/exec transaction discipline, with no central
//! coordinator.
//!
//! Module map:
//! - domain: ids, task state, command envelope, task record
//! - store: store port, transaction model, in-memory and Redis adapters
//! - task: task trees, templates, preparation pipeline
//! - composite: chain, group, and leaf command handlers
//! - queue: host-facing handle (construct, submit, subscribe)
//! - worker: claim and dispatch loop
//! - events: terminal event surface
//! - error: crate-level error type

pub mod domain;
pub mod error;
pub mod events;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;

pub(crate) mod composite;

pub use domain::{Command, CommandType, TaskId, TaskKind, TaskRecord, TaskState, TaskUid};
pub use error::BraidError;
pub use events::{EventBus, TaskEvent};
pub use queue::{Queue, QueueBuilder};
pub use store::{KeySpace, MemoryStore, Op, RedisStore, Store, Transaction};
pub use task::{Task, Template};
pub use worker::WorkerGroup;
