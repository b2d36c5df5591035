use thiserror::Error;

use crate::domain::TaskKind;

#[derive(Debug, Error)]
pub enum BraidError {
    /// A composite was prepared with no children. The task is never persisted.
    #[error("{kind} requires at least one child")]
    NoChildren { kind: TaskKind },

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("duplicate template: {0}")]
    DuplicateTemplate(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("store: {0}")]
    Store(String),

    #[error("codec: {0}")]
    Codec(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for BraidError {
    fn from(e: serde_json::Error) -> Self {
        BraidError::Codec(e.to_string())
    }
}

impl From<redis::RedisError> for BraidError {
    fn from(e: redis::RedisError) -> Self {
        BraidError::Store(e.to_string())
    }
}
