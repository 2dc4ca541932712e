use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Weak};

use anyhow::{bail, Context, Result};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use ps_color::{ClassificationFamily, ColorCacheArena, GradientPreference};
use ps_core::events::events::{DatasetImported, RequestEvicted, RequestsChanged, TaskCancelled, TaskFailed};
use ps_core::prefs::PLOT_CONFIG_KEY;
use ps_core::settings::PlotSettings;
use ps_core::{
    CoreSettings, EventBus, FilterStateManager, PreferenceStore, Predicate, QueryIntent, RequestId,
    RequestRecord, RequestUpdate, SelectIntent, Value,
};
use ps_data::dataset::{batch_reader, source_table};
use ps_data::schema::value_at;
use ps_data::{
    BlobStore, CsvExporter, Database, ErrorKind, QueryEngine, QuotaInfo, RequestStore, RequestSubscriber,
    SqlitePreferences,
};
use ps_dispatch::{
    Coordinator, DeleteSummary, ImportSummary, Operation, QueryStream, Services, TaskError, TaskId,
    TaskOutcome, WorkerEvent,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::notifications::Notifications;

/// Everything a front end needs, wired together: request records, the
/// dataset store, query dispatch, colors and the shared filter state.
pub struct Explorer {
    settings: CoreSettings,
    requests: RequestStore,
    prefs: Arc<dyn PreferenceStore>,
    coordinator: Coordinator,
    colors: Arc<ColorCacheArena>,
    filter: Arc<FilterStateManager>,
    events: Arc<EventBus>,
    notifications: Arc<Notifications>,
    pump: JoinHandle<()>,
}

impl Explorer {
    /// Open (or create) the store under `settings.storage.root`.
    /// Must be called from within a tokio runtime.
    pub async fn open(mut settings: CoreSettings) -> Result<Self> {
        let storage = &settings.storage;
        tokio::fs::create_dir_all(&storage.root)
            .await
            .with_context(|| format!("Failed to create {}", storage.root.display()))?;

        let db_path = storage.database_path();
        let db = Database::open(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        let blobs = BlobStore::open(storage)
            .await
            .context("Failed to open the dataset store")?;
        let engine = QueryEngine::open(storage.root.join(".engine"), blobs.clone(), settings.query.batch_rows)
            .context("Failed to start the query engine")?;
        let requests = RequestStore::new(db.clone());
        let prefs: Arc<dyn PreferenceStore> = Arc::new(SqlitePreferences::new(db));
        if let Some(plot) = load_plot_settings(prefs.as_ref()) {
            settings.plot = plot;
        }
        let storage = &settings.storage;

        let events = Arc::new(EventBus::new());
        let colors = ColorCacheArena::new(prefs.clone(), GradientPreference::from_settings(&settings.plot))?
            .with_events(events.clone());

        let services = Services {
            blobs,
            engine,
            requests: requests.clone(),
        };
        let coordinator = Coordinator::new(services, &settings.workers);

        let notifications = Arc::new(Notifications::new());
        let pump = tokio::spawn(pump_events(
            coordinator.subscribe(),
            events.clone(),
            notifications.clone(),
        ));

        info!(
            root = %storage.root.display(),
            workers = coordinator.pool().size(),
            "Explorer ready"
        );

        Ok(Self {
            settings,
            requests,
            prefs,
            coordinator,
            colors: Arc::new(colors),
            filter: Arc::new(FilterStateManager::new()),
            events,
            notifications,
            pump,
        })
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    /// Replace the plot settings and remember them for the next session
    pub async fn set_plot_settings(&mut self, plot: PlotSettings) -> Result<()> {
        self.prefs
            .save(PLOT_CONFIG_KEY, &serde_json::to_string(&plot)?)?;
        if let Some(id) = self.filter.snapshot().primary {
            if let Some(rows) = self.requests.get(id).await?.row_count {
                self.filter.update_row_count(rows, plot.large_threshold);
            }
        }
        self.settings.plot = plot;
        Ok(())
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn colors(&self) -> &Arc<ColorCacheArena> {
        &self.colors
    }

    pub fn filter(&self) -> &Arc<FilterStateManager> {
        &self.filter
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn notifications(&self) -> &Arc<Notifications> {
        &self.notifications
    }

    // ---- requests ----

    /// Record a new pending request
    pub async fn submit_request(&self, api: &str, parameters: serde_json::Value) -> Result<RequestId> {
        let id = self
            .requests
            .add_pending_with(Some(api.to_string()), parameters)
            .await?;
        self.requests
            .update(
                id,
                RequestUpdate {
                    start_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.events.publish(RequestsChanged { request_id: id });
        Ok(id)
    }

    /// Apply an arbitrary record update, e.g. a status change reported by
    /// the remote service
    pub async fn update_request(&self, request_id: RequestId, update: RequestUpdate) -> Result<RequestRecord> {
        let record = self.requests.update(request_id, update).await?;
        self.events.publish(RequestsChanged { request_id });
        Ok(record)
    }

    /// Store the result payload of a request and mark it successful
    pub async fn complete_request(
        &self,
        request_id: RequestId,
        api: &str,
        payload: Vec<u8>,
        row_count: Option<u64>,
    ) -> TaskOutcome<ImportSummary> {
        let outcome = self
            .coordinator
            .import(request_id, api, Arc::new(payload), row_count)
            .wait()
            .await;
        if let TaskOutcome::Completed(summary) = &outcome {
            self.events.publish(DatasetImported {
                request_id,
                file: summary.file.clone(),
                row_count: summary.row_count,
            });
            self.events.publish(RequestsChanged { request_id });
            if self.filter.snapshot().primary == Some(request_id) {
                self.filter
                    .update_row_count(summary.row_count, self.settings.plot.large_threshold);
            }
        }
        outcome
    }

    pub async fn request(&self, request_id: RequestId) -> Result<RequestRecord> {
        Ok(self.requests.get(request_id).await?)
    }

    pub async fn list_requests(&self) -> Result<Vec<RequestRecord>> {
        Ok(self.requests.list().await?)
    }

    pub fn subscribe_requests(&self, subscriber: Weak<dyn RequestSubscriber>) {
        self.requests.subscribe(subscriber);
    }

    /// Cancel a request's work, then drop its dataset, record and caches
    pub async fn delete_request(&self, request_id: RequestId) -> TaskOutcome<DeleteSummary> {
        let stopped = self.coordinator.cancel_request(request_id);
        if stopped > 0 {
            info!(request_id, stopped, "Cancelled work of a deleted request");
        }
        let outcome = self.coordinator.delete(request_id).await.wait().await;
        if outcome.is_completed() {
            let evicted = self.colors.evict_request(request_id);
            self.filter.forget_request(request_id);
            self.events.publish(RequestEvicted { request_id });
            self.events.publish(RequestsChanged { request_id });
            info!(request_id, evicted, "Request deleted");
        }
        outcome
    }

    /// Delete every request. Returns how many were deleted.
    pub async fn delete_all_requests(&self) -> Result<usize> {
        let mut deleted = 0;
        for id in self.requests.ids().await? {
            match self.delete_request(id).await {
                TaskOutcome::Completed(_) => deleted += 1,
                TaskOutcome::Failed(e) => return Err(e.into()),
                TaskOutcome::Cancelled => warn!(request_id = id, "Delete was cancelled"),
            }
        }
        Ok(deleted)
    }

    pub async fn quota(&self) -> Result<QuotaInfo> {
        Ok(self.coordinator.services().blobs.quota().await?)
    }

    // ---- views ----

    /// Make `request_id` the dataset every view shows
    pub async fn set_primary(&self, request_id: Option<RequestId>) -> Result<()> {
        let Some(id) = request_id else {
            self.filter.set_primary(None, None);
            return Ok(());
        };
        let record = self.requests.get(id).await?;
        self.filter.set_primary(Some(id), record.api.clone());
        if let Some(rows) = record.row_count {
            self.filter
                .update_row_count(rows, self.settings.plot.large_threshold);
        }
        Ok(())
    }

    /// Rows of one dataset
    pub async fn query_dataset(
        &self,
        request_id: RequestId,
        predicate: Predicate,
        projection: Vec<String>,
    ) -> TaskOutcome<QueryStream> {
        let file = match self.dataset_file(request_id, Operation::Query).await {
            Ok(file) => file,
            Err(e) => return self.fail(e),
        };
        let select = SelectIntent::new(predicate).project(projection);
        self.coordinator.query(request_id, vec![file], select, None).await
    }

    /// Rows of the active requests under the shared filter. Large datasets
    /// are thinned to the configured point budget.
    pub async fn query_view(&self) -> TaskOutcome<QueryStream> {
        let state = self.filter.snapshot();
        let ids = state.active_requests();
        let Some(&primary) = ids.first() else {
            return self.fail(TaskError::invalid(Operation::Query, None, "No dataset selected"));
        };
        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            match self.dataset_file(id, Operation::Query).await {
                Ok(file) => files.push(file),
                Err(e) => return self.fail(e),
            }
        }
        let select = match self.filter.select_intent() {
            QueryIntent::Select(select) => select,
            _ => SelectIntent::new(self.filter.predicate()),
        };
        let max_points = state.large_dataset.then_some(self.settings.query.max_points);
        self.coordinator.query(primary, files, select, max_points).await
    }

    /// Sorted distinct non-null values of `column`
    pub async fn distinct_values(&self, request_id: RequestId, column: &str) -> TaskOutcome<Vec<Value>> {
        let intent = QueryIntent::distinct(column);
        self.aggregate(&[request_id], intent).await.map(|batches| {
            batches
                .iter()
                .filter(|batch| batch.num_columns() > 0)
                .flat_map(|batch| {
                    let array = batch.column(0);
                    (0..batch.num_rows()).map(move |row| value_at(array.as_ref(), row))
                })
                .collect()
        })
    }

    /// Run a distinct or aggregate query over one or more datasets
    pub async fn aggregate(&self, request_ids: &[RequestId], intent: QueryIntent) -> TaskOutcome<Vec<RecordBatch>> {
        let mut files = Vec::with_capacity(request_ids.len());
        for &id in request_ids {
            match self.dataset_file(id, Operation::Aggregate).await {
                Ok(file) => files.push(file),
                Err(e) => return self.fail(e),
            }
        }
        self.coordinator
            .aggregate(request_ids.first().copied(), files, intent)
            .wait()
            .await
    }

    // ---- colors ----

    pub fn color_for(&self, request_id: RequestId, column: &str, value: &Value) -> Arc<str> {
        self.colors.color_for(request_id, column, value)
    }

    pub fn set_class_color(
        &self,
        request_id: RequestId,
        family: ClassificationFamily,
        code: i64,
        color: &str,
    ) -> Result<()> {
        Ok(self.colors.set_color(request_id, family, code, color)?)
    }

    pub fn restore_class_defaults(&self, request_id: RequestId, family: ClassificationFamily) -> Result<()> {
        Ok(self.colors.restore_defaults(request_id, family)?)
    }

    pub fn set_gradient(&self, palette: &str, shades: usize) -> Result<()> {
        let preference = GradientPreference::new(palette, shades)?;
        Ok(self.colors.set_gradient(preference)?)
    }

    // ---- export ----

    /// Write every row of a dataset as CSV, source ids mapped to granule
    /// names. Returns the sink and the number of rows written.
    pub async fn export_csv<W: Write>(&self, request_id: RequestId, sink: W) -> Result<(W, u64)> {
        let file = self.dataset_file(request_id, Operation::Query).await?;
        let handle = self.coordinator.services().blobs.read(&file).await?;
        let name = file.clone();
        let granules = tokio::task::spawn_blocking(move || -> ps_data::Result<_> {
            let reader = batch_reader(&name, &handle.path)?;
            source_table(&reader.schema())
        })
        .await??;

        let mut stream = match self
            .coordinator
            .query(request_id, vec![file], SelectIntent::new(Predicate::True), None)
            .await
        {
            TaskOutcome::Completed(stream) => stream,
            TaskOutcome::Failed(e) => return Err(e.into()),
            TaskOutcome::Cancelled => bail!("Export of request {} was cancelled", request_id),
        };

        let mut exporter = CsvExporter::new(sink).with_source_table(granules);
        while let Some(batch) = stream.next_batch().await {
            exporter.write_batch(&batch?)?;
        }
        if stream.is_cancelled() {
            bail!("Export of request {} was cancelled", request_id);
        }
        let rows = exporter.rows_written();
        info!(request_id, rows, "Exported dataset");
        Ok((exporter.finish()?, rows))
    }

    /// Write rows already in memory, e.g. a selection, as CSV
    pub fn export_rows_csv<W: Write>(
        batches: &[RecordBatch],
        granules: Option<HashMap<i64, String>>,
        sink: W,
    ) -> Result<W> {
        Ok(CsvExporter::new(sink)
            .with_source_table(granules)
            .export_batches(batches)?)
    }

    async fn dataset_file(&self, request_id: RequestId, operation: Operation) -> Result<String, TaskError> {
        let record = self
            .requests
            .get(request_id)
            .await
            .map_err(|e| TaskError::from_data(operation, Some(request_id), &e))?;
        record.file.ok_or_else(|| {
            TaskError::new(
                operation,
                Some(request_id),
                ErrorKind::NotYetAvailable,
                format!("Request {} has no dataset yet", request_id),
            )
        })
    }

    /// Failures found before any task was dispatched
    fn fail<T>(&self, error: TaskError) -> TaskOutcome<T> {
        warn!(operation = %error.operation, request_id = ?error.request_id, "{}", error.message);
        self.notifications.push_error(&error);
        self.events.publish(TaskFailed {
            request_id: error.request_id,
            operation: error.operation.to_string(),
            message: error.message.clone(),
        });
        TaskOutcome::Failed(error)
    }
}

impl Drop for Explorer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for Explorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Explorer")
            .field("root", &self.settings.storage.root)
            .field("filter_version", &self.filter.version())
            .field("notifications", &self.notifications.len())
            .finish()
    }
}

/// Plot settings saved by an earlier session. Unreadable values are ignored.
fn load_plot_settings(prefs: &dyn PreferenceStore) -> Option<PlotSettings> {
    let raw = match prefs.load(PLOT_CONFIG_KEY) {
        Ok(raw) => raw?,
        Err(e) => {
            warn!("Could not read saved plot settings: {}", e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(plot) => Some(plot),
        Err(e) => {
            warn!("Ignoring saved plot settings: {}", e);
            None
        }
    }
}

/// Turn worker events into notifications and bus events
async fn pump_events(
    mut rx: broadcast::Receiver<WorkerEvent>,
    events: Arc<EventBus>,
    notifications: Arc<Notifications>,
) {
    let mut owners: HashMap<TaskId, (Operation, Option<RequestId>)> = HashMap::new();
    loop {
        match rx.recv().await {
            Ok(WorkerEvent::Queued {
                task_id,
                operation,
                request_id,
            }) => {
                owners.insert(task_id, (operation, request_id));
            }
            Ok(WorkerEvent::Failed { task_id, error }) => {
                owners.remove(&task_id);
                notifications.push_error(&error);
                events.publish(TaskFailed {
                    request_id: error.request_id,
                    operation: error.operation.to_string(),
                    message: error.message,
                });
            }
            Ok(WorkerEvent::Cancelled { task_id }) => {
                if let Some((operation, request_id)) = owners.remove(&task_id) {
                    events.publish(TaskCancelled {
                        request_id,
                        operation: operation.to_string(),
                    });
                }
            }
            Ok(WorkerEvent::Completed { task_id }) => {
                owners.remove(&task_id);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event pump fell behind; some notifications were dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
