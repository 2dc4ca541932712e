//! Task lifecycle types

use std::sync::Arc;

use async_trait::async_trait;
use ps_core::{CancelToken, RequestId};
use ps_data::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordinator::Services;
use crate::progress::ProgressReporter;
use crate::{Operation, TaskError};

pub type TaskId = u64;

/// Where a task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Queued tasks may start or be abandoned; running tasks may settle;
    /// settled tasks never move again
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match self {
            TaskState::Queued => matches!(
                next,
                TaskState::Running | TaskState::Failed | TaskState::Cancelled
            ),
            TaskState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// How a task ended. Cancellation is not a failure.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(TaskError),
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TaskOutcome<U> {
        match self {
            TaskOutcome::Completed(value) => TaskOutcome::Completed(f(value)),
            TaskOutcome::Failed(error) => TaskOutcome::Failed(error),
            TaskOutcome::Cancelled => TaskOutcome::Cancelled,
        }
    }
}

/// What a worker gets to run a task with
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub cancel: CancelToken,
    pub progress: ProgressReporter,
    pub services: Arc<Services>,
}

/// A unit of background work
#[async_trait]
pub trait Task: Send + 'static {
    type Output: Send + 'static;

    fn operation(&self) -> Operation;

    fn request_id(&self) -> Option<RequestId>;

    /// File this task mutates. Tasks sharing a destination never overlap.
    fn destination(&self) -> Option<String> {
        None
    }

    async fn run(self, ctx: TaskContext) -> ps_data::Result<Self::Output>;
}

/// Caller's view of a dispatched task
pub struct TaskHandle<T> {
    pub(crate) id: TaskId,
    pub(crate) operation: Operation,
    pub(crate) request_id: Option<RequestId>,
    pub(crate) cancel: CancelToken,
    pub(crate) state: watch::Receiver<TaskState>,
    pub(crate) join: JoinHandle<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Ask the worker to stop at its next chunk boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to settle
    pub async fn wait(self) -> TaskOutcome<T> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => TaskOutcome::Failed(TaskError::new(
                self.operation,
                self.request_id,
                ErrorKind::Internal,
                e.to_string(),
            )),
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("request_id", &self.request_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use TaskState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Completed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Queued));
        for settled in [Completed, Failed, Cancelled] {
            assert!(settled.is_terminal());
            assert!(!settled.can_transition_to(Running));
            assert!(!settled.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_outcome_helpers() {
        let done: TaskOutcome<u32> = TaskOutcome::Completed(3);
        assert_eq!(done.state(), TaskState::Completed);
        assert_eq!(done.map(|v| v * 2).completed(), Some(6));

        let cancelled: TaskOutcome<u32> = TaskOutcome::Cancelled;
        assert!(cancelled.is_cancelled());
        assert!(cancelled.error().is_none());
    }
}
