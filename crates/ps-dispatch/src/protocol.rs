//! Messages exchanged with workers

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use ps_core::{QueryIntent, RequestId};
use serde::{Deserialize, Serialize};

use crate::coordinator::QueryStream;
use crate::task::{TaskHandle, TaskId, TaskOutcome, TaskState};
use crate::tasks::{DeleteSummary, ImportSummary};
use crate::{Operation, Result, TaskError};

/// Work requested from the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Store a completed request's payload and mark the request done
    Import {
        request_id: RequestId,
        api: String,
        #[serde(skip)]
        payload: Arc<Vec<u8>>,
        row_count: Option<u64>,
    },
    /// Stream rows of a stored dataset
    Query {
        request_id: RequestId,
        files: Vec<String>,
        intent: QueryIntent,
        max_points: Option<usize>,
    },
    /// Run an aggregate or distinct query to completion
    Aggregate {
        request_id: Option<RequestId>,
        files: Vec<String>,
        intent: QueryIntent,
    },
    /// Remove a request's dataset file and record
    Delete { request_id: RequestId },
    Cancel { task_id: TaskId },
}

impl WorkerCommand {
    pub fn operation(&self) -> Option<Operation> {
        match self {
            WorkerCommand::Import { .. } => Some(Operation::Import),
            WorkerCommand::Query { .. } => Some(Operation::Query),
            WorkerCommand::Aggregate { .. } => Some(Operation::Aggregate),
            WorkerCommand::Delete { .. } => Some(Operation::Delete),
            WorkerCommand::Cancel { .. } => None,
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            WorkerCommand::Import { request_id, .. }
            | WorkerCommand::Query { request_id, .. }
            | WorkerCommand::Delete { request_id } => Some(*request_id),
            WorkerCommand::Aggregate { request_id, .. } => *request_id,
            WorkerCommand::Cancel { .. } => None,
        }
    }

    /// Reject malformed commands before any worker picks them up
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(TaskError::invalid(
                self.operation().unwrap_or(Operation::Query),
                self.request_id(),
                message,
            ))
        };
        match self {
            WorkerCommand::Import { api, payload, .. } => {
                if api.is_empty()
                    || !api
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    return invalid("api name must be non-empty and alphanumeric");
                }
                if payload.is_empty() {
                    return invalid("payload is empty");
                }
            }
            WorkerCommand::Query {
                files,
                intent,
                max_points,
                ..
            } => {
                if files.is_empty() {
                    return invalid("query needs at least one dataset");
                }
                if !matches!(intent, QueryIntent::Select(_)) {
                    return invalid("row queries take a select intent");
                }
                if *max_points == Some(0) {
                    return invalid("max_points must be positive");
                }
            }
            WorkerCommand::Aggregate { files, intent, .. } => {
                if files.is_empty() {
                    return invalid("query needs at least one dataset");
                }
                if matches!(intent, QueryIntent::Select(_)) {
                    return invalid("aggregate tasks take an aggregate or distinct intent");
                }
            }
            WorkerCommand::Delete { .. } | WorkerCommand::Cancel { .. } => {}
        }
        Ok(())
    }
}

/// Lifecycle notifications broadcast by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Queued {
        task_id: TaskId,
        operation: Operation,
        request_id: Option<RequestId>,
    },
    Started {
        task_id: TaskId,
    },
    /// Percent complete, emitted in coarse steps
    Progress {
        task_id: TaskId,
        percent: u8,
    },
    /// One batch of rows was handed to the consumer
    Rows {
        task_id: TaskId,
        rows: u64,
    },
    Completed {
        task_id: TaskId,
    },
    Failed {
        task_id: TaskId,
        error: TaskError,
    },
    Cancelled {
        task_id: TaskId,
    },
}

impl WorkerEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            WorkerEvent::Queued { task_id, .. }
            | WorkerEvent::Started { task_id }
            | WorkerEvent::Progress { task_id, .. }
            | WorkerEvent::Rows { task_id, .. }
            | WorkerEvent::Completed { task_id }
            | WorkerEvent::Failed { task_id, .. }
            | WorkerEvent::Cancelled { task_id } => *task_id,
        }
    }

    /// Event announcing that a task reached `state`
    pub(crate) fn settled(task_id: TaskId, state: TaskState, error: Option<TaskError>) -> Option<Self> {
        match (state, error) {
            (TaskState::Running, _) => Some(WorkerEvent::Started { task_id }),
            (TaskState::Completed, _) => Some(WorkerEvent::Completed { task_id }),
            (TaskState::Cancelled, _) => Some(WorkerEvent::Cancelled { task_id }),
            (TaskState::Failed, Some(error)) => Some(WorkerEvent::Failed { task_id, error }),
            _ => None,
        }
    }
}

/// What dispatching a command produced
#[derive(Debug)]
pub enum Dispatched {
    Import(TaskHandle<ImportSummary>),
    Query(TaskOutcome<QueryStream>),
    Aggregate(TaskHandle<Vec<RecordBatch>>),
    Delete(TaskHandle<DeleteSummary>),
    /// Whether the named task was still in flight
    Cancel(bool),
}
