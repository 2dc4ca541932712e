//! Background task dispatch for pointscope
//!
//! Storage writes and analytical queries never run on the caller's task.
//! The [`Coordinator`] queues them on a bounded [`WorkerPool`], serializes
//! writes per destination file, tracks each task through
//! `queued -> running -> completed | failed | cancelled`, and broadcasts
//! [`WorkerEvent`]s describing that progress.

pub mod coordinator;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod task;
pub mod tasks;

use std::fmt;

use ps_core::RequestId;
use ps_data::{DataError, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use coordinator::{Coordinator, DestinationPolicy, QueryStream, Services};
pub use pool::WorkerPool;
pub use protocol::{Dispatched, WorkerCommand, WorkerEvent};
pub use task::{Task, TaskContext, TaskHandle, TaskId, TaskOutcome, TaskState};
pub use tasks::{AggregateTask, DeleteSummary, DeleteTask, ImportSummary, ImportTask};

/// The kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Import,
    Query,
    Aggregate,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Import => "import",
            Operation::Query => "query",
            Operation::Aggregate => "aggregate",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed task, tagged with what it was doing and for which request
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{operation} failed: {message}")]
pub struct TaskError {
    pub request_id: Option<RequestId>,
    pub operation: Operation,
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(
        operation: Operation,
        request_id: Option<RequestId>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            operation,
            kind,
            message: message.into(),
        }
    }

    /// Attach the owning operation and request to a storage or query error
    pub fn from_data(operation: Operation, request_id: Option<RequestId>, error: &DataError) -> Self {
        Self::new(operation, request_id, error.kind(), error.to_string())
    }

    pub fn invalid(operation: Operation, request_id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(operation, request_id, ErrorKind::InvalidCommand, message)
    }
}

pub type Result<T, E = TaskError> = std::result::Result<T, E>;
