//! Terminal event surface.
//!
//! Consumers should not poll record state; they subscribe and receive one
//! end event per task when it reaches `finished`, successfully or with an
//! error. The bus is process-local: each worker process announces the
//! terminal transitions its own transactions won.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::TaskId;

/// Emitted once per task on its terminal transition.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub id: TaskId,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl TaskEvent {
    pub fn ended_ok(id: TaskId, result: Option<Value>) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn ended_err(id: TaskId, error: Value) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget: a send with no subscribers is not an error.
    pub fn emit(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_end_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let id = TaskId::generate();
        bus.emit(TaskEvent::ended_ok(id, Some(json!(8))));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.result, Some(json!(8)));
        assert!(!event.is_error());
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(TaskEvent::ended_err(
            TaskId::generate(),
            json!({"message": "boom"}),
        ));
    }
}
