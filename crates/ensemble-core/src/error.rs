//! Error types, split by lifecycle phase: [`ConstructError`] for building
//! tasks from definitions, [`TaskError`] for executing them.

use thiserror::Error;

/// Errors raised while registering factories or constructing tasks from
/// definition documents. Fatal at construction time; nothing is partially
/// registered.
#[derive(Debug, Error)]
pub enum ConstructError {
    #[error("factory for task type {0:?} is not found")]
    UnknownType(String),

    #[error("factory for task type {0:?} is already registered")]
    DuplicateType(String),

    #[error("duplicate task name {0:?}")]
    DuplicateTaskName(String),

    #[error("loader named {0:?} is not found")]
    UnknownLoader(String),

    #[error("loader named {0:?} is already registered")]
    DuplicateLoader(String),

    #[error("task named {0:?} is not found")]
    UnknownTask(String),

    #[error("invalid task definition: {0}")]
    Definition(String),
}

impl From<serde_json::Error> for ConstructError {
    fn from(err: serde_json::Error) -> Self {
        ConstructError::Definition(err.to_string())
    }
}

/// Errors raised while executing a task.
///
/// Cloneable so results can travel through iterator and actor channels; error
/// detail is carried as a message rather than a source chain.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// The task's deadline elapsed before its subtasks finished.
    #[error("deadline exceeded")]
    Timeout,

    /// The surrounding execution was cancelled.
    #[error("execution has been canceled")]
    Canceled,

    /// A template expression could not be evaluated.
    #[error("{0}")]
    Evaluation(String),

    /// An evaluated value could not be decoded into the expected shape.
    #[error("{0}")]
    Decode(String),

    /// A value did not validate against its schema.
    #[error("{0}")]
    Schema(String),

    /// A loop's iterator subtask did not produce an iterator handle.
    #[error("bad iterator: {0}")]
    BadIterator(String),

    /// A task failed while performing its effect.
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        TaskError::Evaluation(message.into())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Decode(err.to_string())
    }
}
