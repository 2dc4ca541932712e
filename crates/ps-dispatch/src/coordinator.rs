//! Task coordination: queueing, per-destination ordering, cancellation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use ps_core::request::dataset_file_name;
use ps_core::settings::WorkerSettings;
use ps_core::{CancelToken, QueryIntent, RequestId, SelectIntent};
use ps_data::{BlobStore, Column, QueryEngine, RequestStore, RowBatches};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::pool::WorkerPool;
use crate::progress::ProgressReporter;
use crate::protocol::{Dispatched, WorkerCommand, WorkerEvent};
use crate::task::{Task, TaskContext, TaskHandle, TaskId, TaskOutcome, TaskState};
use crate::tasks::{AggregateTask, DeleteTask, ImportTask};
use crate::{Operation, Result, TaskError};

const EVENT_CAPACITY: usize = 256;

/// Storage and query services shared by every task
pub struct Services {
    pub blobs: BlobStore,
    pub engine: QueryEngine,
    pub requests: RequestStore,
}

/// What happens when a task targets a destination another task is
/// still writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationPolicy {
    /// Cancel the earlier task, then start once it has stopped
    #[default]
    CancelPrevious,
    /// Start once the earlier task has finished
    AwaitPrevious,
}

struct TaskEntry {
    operation: Operation,
    request_id: Option<RequestId>,
    state: watch::Sender<TaskState>,
    cancel: CancelToken,
}

struct DestinationSlot {
    task_id: TaskId,
    cancel: CancelToken,
    lock: Arc<tokio::sync::Mutex<()>>,
}

struct Inner {
    services: Arc<Services>,
    pool: WorkerPool,
    events: broadcast::Sender<WorkerEvent>,
    tasks: Mutex<AHashMap<TaskId, TaskEntry>>,
    destinations: Mutex<AHashMap<String, DestinationSlot>>,
    next_id: AtomicU64,
    progress_step: u8,
    policy: DestinationPolicy,
}

impl Inner {
    fn register(
        &self,
        operation: Operation,
        request_id: Option<RequestId>,
    ) -> (TaskId, CancelToken, watch::Receiver<TaskState>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancelToken::new();
        let (state, receiver) = watch::channel(TaskState::Queued);
        self.tasks.lock().insert(
            id,
            TaskEntry {
                operation,
                request_id,
                state,
                cancel: cancel.clone(),
            },
        );
        debug!(task_id = id, ?request_id, "Queued {}", operation);
        let _ = self.events.send(WorkerEvent::Queued {
            task_id: id,
            operation,
            request_id,
        });
        (id, cancel, receiver)
    }

    /// Move a task to `next`. Settled tasks leave the in-flight table.
    fn transition(&self, id: TaskId, next: TaskState, error: Option<TaskError>) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(entry) = tasks.get(&id) else {
            return false;
        };
        let current = *entry.state.borrow();
        if !current.can_transition_to(next) {
            warn!(task_id = id, "Ignoring task transition {:?} -> {:?}", current, next);
            return false;
        }
        entry.state.send_replace(next);
        if next.is_terminal() {
            tasks.remove(&id);
        }
        drop(tasks);

        if let Some(event) = WorkerEvent::settled(id, next, error) {
            let _ = self.events.send(event);
        }
        true
    }

    fn settle<T>(
        &self,
        id: TaskId,
        operation: Operation,
        request_id: Option<RequestId>,
        outcome: TaskOutcome<T>,
    ) -> TaskOutcome<T> {
        match &outcome {
            TaskOutcome::Completed(_) => info!(task_id = id, ?request_id, "{} completed", operation),
            TaskOutcome::Failed(e) => {
                error!(task_id = id, ?request_id, kind = ?e.kind, "{} failed: {}", operation, e.message)
            }
            TaskOutcome::Cancelled => info!(task_id = id, ?request_id, "{} cancelled", operation),
        }
        self.transition(id, outcome.state(), outcome.error().cloned());
        outcome
    }

    /// Record `id` as the current writer of `destination` and return the
    /// lock every writer of that destination takes in turn
    fn claim_destination(
        &self,
        destination: &str,
        id: TaskId,
        cancel: &CancelToken,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let mut destinations = self.destinations.lock();
        let lock = match destinations.get(destination) {
            Some(previous) => {
                if self.policy == DestinationPolicy::CancelPrevious {
                    info!(
                        task_id = previous.task_id,
                        file = destination,
                        "Cancelling earlier task for the same file"
                    );
                    previous.cancel.cancel();
                }
                previous.lock.clone()
            }
            None => Arc::new(tokio::sync::Mutex::new(())),
        };
        destinations.insert(
            destination.to_string(),
            DestinationSlot {
                task_id: id,
                cancel: cancel.clone(),
                lock: lock.clone(),
            },
        );
        lock
    }

    fn release_destination(&self, destination: &str, id: TaskId) {
        let mut destinations = self.destinations.lock();
        if destinations.get(destination).map(|slot| slot.task_id) == Some(id) {
            destinations.remove(destination);
        }
    }

    fn reporter(&self, id: TaskId) -> ProgressReporter {
        ProgressReporter::new(id, self.progress_step, self.events.clone())
    }

    async fn execute<T: Task>(
        self: Arc<Self>,
        id: TaskId,
        task: T,
        destination: Option<Arc<tokio::sync::Mutex<()>>>,
        cancel: CancelToken,
    ) -> TaskOutcome<T::Output> {
        let operation = task.operation();
        let request_id = task.request_id();

        let _turn = match destination {
            Some(lock) => tokio::select! {
                guard = lock.lock_owned() => Some(guard),
                _ = cancel.cancelled() => return TaskOutcome::Cancelled,
            },
            None => None,
        };
        let Some(_permit) = self.pool.acquire(&cancel).await else {
            return TaskOutcome::Cancelled;
        };
        if !self.transition(id, TaskState::Running, None) {
            return TaskOutcome::Cancelled;
        }

        let ctx = TaskContext {
            task_id: id,
            cancel: cancel.clone(),
            progress: self.reporter(id),
            services: self.services.clone(),
        };
        match task.run(ctx).await {
            Ok(value) => TaskOutcome::Completed(value),
            Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
            Err(e) => TaskOutcome::Failed(TaskError::from_data(operation, request_id, &e)),
        }
    }
}

/// Runs storage and query work off the caller's task
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(services: Services, workers: &WorkerSettings) -> Self {
        Self::with_policy(services, workers, DestinationPolicy::default())
    }

    pub fn with_policy(services: Services, workers: &WorkerSettings, policy: DestinationPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pool = WorkerPool::new(workers.effective_pool_size());
        info!(workers = pool.size(), ?policy, "Starting task coordinator");
        Self {
            inner: Arc::new(Inner {
                services: Arc::new(services),
                pool,
                events,
                tasks: Mutex::new(AHashMap::new()),
                destinations: Mutex::new(AHashMap::new()),
                next_id: AtomicU64::new(0),
                progress_step: workers.progress_step,
                policy,
            }),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.inner.services
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Lifecycle events of every task dispatched from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a task. It starts once its destination is free and a worker
    /// slot is available.
    pub fn spawn<T: Task>(&self, task: T) -> TaskHandle<T::Output> {
        let operation = task.operation();
        let request_id = task.request_id();
        let destination = task.destination();
        let (id, cancel, state) = self.inner.register(operation, request_id);
        let lock = destination
            .as_deref()
            .map(|d| self.inner.claim_destination(d, id, &cancel));

        let inner = self.inner.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = inner.clone().execute(id, task, lock, token).await;
            if let Some(destination) = &destination {
                inner.release_destination(destination, id);
            }
            inner.settle(id, operation, request_id, outcome)
        });

        TaskHandle {
            id,
            operation,
            request_id,
            cancel,
            state,
            join,
        }
    }

    pub fn import(
        &self,
        request_id: RequestId,
        api: &str,
        payload: Arc<Vec<u8>>,
        row_count: Option<u64>,
    ) -> TaskHandle<crate::tasks::ImportSummary> {
        self.spawn(ImportTask::new(request_id, api, payload, row_count))
    }

    pub fn aggregate(
        &self,
        request_id: Option<RequestId>,
        files: Vec<String>,
        intent: QueryIntent,
    ) -> TaskHandle<Vec<RecordBatch>> {
        self.spawn(AggregateTask::new(request_id, files, intent))
    }

    /// Delete a request's dataset and record, ordered after any write to
    /// the same file
    pub async fn delete(&self, request_id: RequestId) -> TaskHandle<crate::tasks::DeleteSummary> {
        let file = match self.inner.services.requests.get(request_id).await {
            Ok(record) => record
                .file
                .or_else(|| record.api.map(|api| dataset_file_name(&api, request_id))),
            Err(_) => None,
        };
        self.spawn(DeleteTask::new(request_id, file))
    }

    /// Start a row query. A completed outcome carries the open stream; the
    /// task stays running until the stream is exhausted, cancelled or
    /// dropped. With `max_points` the rows are thinned to at most that many.
    ///
    /// The worker slot covers loading the tables and opening the statement.
    /// It is handed back once rows flow, so a caller holding an undrained
    /// stream never starves later queries.
    pub async fn query(
        &self,
        request_id: RequestId,
        files: Vec<String>,
        select: SelectIntent,
        max_points: Option<usize>,
    ) -> TaskOutcome<QueryStream> {
        let (id, cancel, _state) = self.inner.register(Operation::Query, Some(request_id));
        match self.open_stream(id, request_id, files, select, max_points, cancel).await {
            TaskOutcome::Completed(stream) => TaskOutcome::Completed(stream),
            other => self.inner.settle(id, Operation::Query, Some(request_id), other),
        }
    }

    async fn open_stream(
        &self,
        id: TaskId,
        request_id: RequestId,
        files: Vec<String>,
        select: SelectIntent,
        max_points: Option<usize>,
        cancel: CancelToken,
    ) -> TaskOutcome<QueryStream> {
        let Some(_permit) = self.inner.pool.acquire(&cancel).await else {
            return TaskOutcome::Cancelled;
        };
        if !self.inner.transition(id, TaskState::Running, None) {
            return TaskOutcome::Cancelled;
        }
        let engine = &self.inner.services.engine;
        let opened = match max_points {
            Some(max) => engine.sampled_select(&files, select, max, cancel.clone()).await,
            None => {
                engine
                    .query_intent_with_cancel(&files, &QueryIntent::Select(select), cancel.clone())
                    .await
            }
        };
        match opened {
            Ok(handle) => TaskOutcome::Completed(QueryStream {
                task_id: id,
                request_id,
                rows: handle.read_rows(),
                progress: self.inner.reporter(id),
                inner: self.inner.clone(),
                delivered: 0,
                settled: false,
            }),
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => TaskOutcome::Cancelled,
            Err(e) => TaskOutcome::Failed(TaskError::from_data(Operation::Query, Some(request_id), &e)),
        }
    }

    /// Cancel a task. Returns whether it was still in flight.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.inner.tasks.lock().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight task that belongs to `request_id`
    pub fn cancel_request(&self, request_id: RequestId) -> usize {
        let tasks = self.inner.tasks.lock();
        let mut cancelled = 0;
        for entry in tasks.values().filter(|e| e.request_id == Some(request_id)) {
            entry.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// State of an in-flight task; `None` once it has settled
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.inner.tasks.lock().get(&id).map(|e| *e.state.borrow())
    }

    /// `(id, operation, request id, state)` of every unsettled task
    pub fn in_flight(&self) -> Vec<(TaskId, Operation, Option<RequestId>, TaskState)> {
        let mut tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .iter()
            .map(|(id, e)| (*id, e.operation, e.request_id, *e.state.borrow()))
            .collect();
        tasks.sort_by_key(|t| t.0);
        tasks
    }

    /// Validate and run a protocol command
    pub async fn dispatch(&self, command: WorkerCommand) -> Result<Dispatched> {
        command.validate()?;
        Ok(match command {
            WorkerCommand::Import {
                request_id,
                api,
                payload,
                row_count,
            } => Dispatched::Import(self.import(request_id, &api, payload, row_count)),
            WorkerCommand::Query {
                request_id,
                files,
                intent: QueryIntent::Select(select),
                max_points,
            } => Dispatched::Query(self.query(request_id, files, select, max_points).await),
            WorkerCommand::Query { request_id, .. } => {
                return Err(TaskError::invalid(
                    Operation::Query,
                    Some(request_id),
                    "row queries take a select intent",
                ))
            }
            WorkerCommand::Aggregate {
                request_id,
                files,
                intent,
            } => Dispatched::Aggregate(self.aggregate(request_id, files, intent)),
            WorkerCommand::Delete { request_id } => Dispatched::Delete(self.delete(request_id).await),
            WorkerCommand::Cancel { task_id } => Dispatched::Cancel(self.cancel(task_id)),
        })
    }
}

/// Rows of a running query task.
///
/// The task settles when the rows run out, the stream is cancelled or it
/// is dropped. Rows are produced under backpressure, at most one buffered
/// batch ahead of the reader.
pub struct QueryStream {
    task_id: TaskId,
    request_id: RequestId,
    rows: RowBatches,
    progress: ProgressReporter,
    inner: Arc<Inner>,
    delivered: u64,
    settled: bool,
}

impl QueryStream {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn schema(&self) -> &[Column] {
        self.rows.schema()
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        self.rows.arrow_schema()
    }

    /// Rows handed out so far
    pub fn rows_delivered(&self) -> u64 {
        self.delivered
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Whether the rows stopped because the query was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.rows.is_cancelled()
    }

    /// Next batch, or `None` once the query is exhausted or stopped
    pub async fn next_batch(&mut self) -> Option<ps_data::Result<RecordBatch>> {
        if self.settled {
            return None;
        }
        let next = self.rows.next_batch().await;
        match &next {
            Some(Ok(batch)) => {
                let rows = batch.num_rows() as u64;
                self.delivered += rows;
                self.progress.rows(rows);
            }
            Some(Err(e)) if e.is_cancelled() => self.settle(TaskOutcome::Cancelled),
            Some(Err(e)) => self.settle(TaskOutcome::Failed(TaskError::from_data(
                Operation::Query,
                Some(self.request_id),
                e,
            ))),
            None if self.rows.is_cancelled() => self.settle(TaskOutcome::Cancelled),
            None => self.settle(TaskOutcome::Completed(())),
        }
        next
    }

    /// Stop the query; the task settles as cancelled
    pub fn cancel(&mut self) {
        self.rows.cancel();
        self.settle(TaskOutcome::Cancelled);
    }

    /// Read every remaining batch
    pub async fn collect(mut self) -> TaskOutcome<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        while let Some(next) = self.next_batch().await {
            match next {
                Ok(batch) => batches.push(batch),
                Err(e) if e.is_cancelled() => return TaskOutcome::Cancelled,
                Err(e) => {
                    return TaskOutcome::Failed(TaskError::from_data(
                        Operation::Query,
                        Some(self.request_id),
                        &e,
                    ))
                }
            }
        }
        if self.rows.is_cancelled() {
            TaskOutcome::Cancelled
        } else {
            TaskOutcome::Completed(batches)
        }
    }

    fn settle(&mut self, outcome: TaskOutcome<()>) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.inner
            .settle(self.task_id, Operation::Query, Some(self.request_id), outcome);
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        if !self.settled {
            self.rows.cancel();
            self.settle(TaskOutcome::Cancelled);
        }
    }
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("task_id", &self.task_id)
            .field("request_id", &self.request_id)
            .field("delivered", &self.delivered)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::{coordinator, payload};
    use ps_core::Predicate;
    use ps_data::ErrorKind;

    async fn imported(coordinator: &Coordinator, rows: usize) -> (RequestId, String) {
        let id = coordinator.services().requests.add_pending().await.unwrap();
        let summary = coordinator
            .import(id, "atl03x", payload(rows, 9), None)
            .wait()
            .await
            .completed()
            .unwrap();
        (id, summary.file)
    }

    fn drain(events: &mut broadcast::Receiver<WorkerEvent>, task_id: TaskId) -> Vec<WorkerEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.task_id() == task_id {
                seen.push(event);
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_query_stream_completes() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let (id, file) = imported(&coordinator, 250).await;
        let mut events = coordinator.subscribe();

        let stream = coordinator
            .query(id, vec![file], SelectIntent::new(Predicate::True).project(["height"]), None)
            .await
            .completed()
            .unwrap();
        let task_id = stream.task_id();
        assert_eq!(coordinator.state(task_id), Some(TaskState::Running));
        // the slot is back once the statement is open
        assert_eq!(coordinator.pool().available(), 1);

        let batches = stream.collect().await.completed().unwrap();
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 250);
        assert_eq!(coordinator.state(task_id), None);
        assert_eq!(coordinator.pool().available(), 1);

        let seen = drain(&mut events, task_id);
        assert!(matches!(seen.first(), Some(WorkerEvent::Queued { .. })));
        assert!(matches!(seen.last(), Some(WorkerEvent::Completed { .. })));
        let rows: u64 = seen
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Rows { rows, .. } => Some(*rows),
                _ => None,
            })
            .sum();
        assert_eq!(rows, 250);
    }

    #[tokio::test]
    async fn test_sampled_query_respects_max_points() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let (id, file) = imported(&coordinator, 1_000).await;
        let batches = coordinator
            .query(id, vec![file], SelectIntent::new(Predicate::True), Some(120))
            .await
            .completed()
            .unwrap()
            .collect()
            .await
            .completed()
            .unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert!(rows > 0 && rows <= 120);
    }

    #[tokio::test]
    async fn test_cancelled_stream_settles_cancelled() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let (id, file) = imported(&coordinator, 1_000).await;
        let mut events = coordinator.subscribe();

        let mut stream = coordinator
            .query(id, vec![file], SelectIntent::new(Predicate::True), None)
            .await
            .completed()
            .unwrap();
        let task_id = stream.task_id();
        assert!(stream.next_batch().await.unwrap().is_ok());
        assert!(coordinator.cancel(task_id));
        while stream.next_batch().await.is_some() {}
        assert!(stream.is_settled());
        assert!(stream.rows_delivered() < 1_000);

        let seen = drain(&mut events, task_id);
        assert!(matches!(seen.last(), Some(WorkerEvent::Cancelled { .. })));
        assert!(!seen.iter().any(|e| matches!(e, WorkerEvent::Failed { .. })));
        assert_eq!(coordinator.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_frees_its_slot() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let (id, file) = imported(&coordinator, 500).await;
        let stream = coordinator
            .query(id, vec![file.clone()], SelectIntent::new(Predicate::True), None)
            .await
            .completed()
            .unwrap();
        let task_id = stream.task_id();
        drop(stream);
        assert_eq!(coordinator.state(task_id), None);
        assert_eq!(coordinator.pool().available(), 1);

        // the next query gets the slot
        let again = coordinator
            .query(id, vec![file], SelectIntent::new(Predicate::True).limit(5), None)
            .await
            .completed()
            .unwrap();
        let batches = again.collect().await.completed().unwrap();
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn test_queued_task_cancelled_before_start() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let (id, file) = imported(&coordinator, 200).await;
        // hold the only slot
        let held = coordinator.pool().acquire(&CancelToken::new()).await.unwrap();

        let intent = QueryIntent::Distinct {
            column: "track".to_string(),
            predicate: Predicate::True,
        };
        let queued = coordinator.aggregate(Some(id), vec![file], intent);
        tokio::task::yield_now().await;
        assert_eq!(queued.state(), TaskState::Queued);
        queued.cancel();
        assert!(queued.wait().await.is_cancelled());
        drop(held);
    }

    #[tokio::test]
    async fn test_open_streams_share_a_single_slot() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let (first_id, first_file) = imported(&coordinator, 700).await;
        let (second_id, second_file) = imported(&coordinator, 300).await;

        let mut first = coordinator
            .query(first_id, vec![first_file], SelectIntent::new(Predicate::True), None)
            .await
            .completed()
            .unwrap();
        assert!(first.next_batch().await.unwrap().is_ok());

        // the first stream is still open and undrained
        let second = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            coordinator.query(second_id, vec![second_file], SelectIntent::new(Predicate::True), None),
        )
        .await
        .expect("second query waited on the first stream")
        .completed()
        .unwrap();

        let second_rows: usize = second
            .collect()
            .await
            .completed()
            .unwrap()
            .iter()
            .map(|b| b.num_rows())
            .sum();
        assert_eq!(second_rows, 300);

        let delivered = first.rows_delivered() as usize;
        let rest: usize = first
            .collect()
            .await
            .completed()
            .unwrap()
            .iter()
            .map(|b| b.num_rows())
            .sum();
        assert_eq!(delivered + rest, 700);
        assert!(coordinator.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_query_errors_carry_the_request() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let outcome = coordinator
            .query(
                7,
                vec!["atl03x_7.arrow".to_string()],
                SelectIntent::new(Predicate::True),
                None,
            )
            .await;
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::TableNotFound);
        assert_eq!(error.request_id, Some(7));
        assert_eq!(error.operation, Operation::Query);
        assert_eq!(coordinator.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_validates_commands() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let command = WorkerCommand::Import {
            request_id: 1,
            api: "atl03x".to_string(),
            payload: Arc::new(Vec::new()),
            row_count: None,
        };
        let err = coordinator.dispatch(command).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidCommand);
        assert!(coordinator.in_flight().is_empty());

        let cancel = coordinator
            .dispatch(WorkerCommand::Cancel { task_id: 99 })
            .await
            .unwrap();
        assert!(matches!(cancel, Dispatched::Cancel(false)));
    }
}
