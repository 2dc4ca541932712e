use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ps_core::fields::FieldNames;
use ps_core::request::{dataset_file_name, RequestSummary};
use ps_core::{RequestId, RequestStatus, RequestUpdate};
use ps_data::dataset::inspect_bytes;
use ps_data::{DataError, WriteOptions};
use tracing::{info, warn};

use crate::task::{Task, TaskContext};
use crate::Operation;

/// Result of storing a request's payload
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSummary {
    pub request_id: RequestId,
    pub file: String,
    pub row_count: u64,
    pub num_bytes: u64,
    pub summary: Option<RequestSummary>,
}

/// Writes a completed request's dataset file and marks the request done
#[derive(Debug, Clone)]
pub struct ImportTask {
    request_id: RequestId,
    api: String,
    payload: Arc<Vec<u8>>,
    row_count: Option<u64>,
}

impl ImportTask {
    pub fn new(request_id: RequestId, api: &str, payload: Arc<Vec<u8>>, row_count: Option<u64>) -> Self {
        Self {
            request_id,
            api: api.to_string(),
            payload,
            row_count,
        }
    }

    pub fn file(&self) -> String {
        dataset_file_name(&self.api, self.request_id)
    }

    async fn import(&self, ctx: &TaskContext) -> ps_data::Result<ImportSummary> {
        let services = &ctx.services;
        let file = self.file();

        let record = services.requests.get(self.request_id).await?;
        if !record.status.can_transition_to(RequestStatus::Success) {
            return Err(DataError::InvalidTransition {
                id: self.request_id,
                from: record.status,
                to: RequestStatus::Success,
            });
        }

        let payload = self.payload.clone();
        let name = file.clone();
        let info = tokio::task::spawn_blocking(move || inspect_bytes(&name, &payload)).await??;
        if let Some(expected) = self.row_count {
            if expected != info.row_count {
                warn!(
                    request_id = self.request_id,
                    expected,
                    actual = info.row_count,
                    "Row count does not match the payload; recording the payload's count"
                );
            }
        }

        let mut percent = ctx.progress.percent_sink();
        let options = WriteOptions {
            chunked: true,
            expected_len: Some(self.payload.len() as u64),
        };
        let handle = services
            .blobs
            .write(
                &file,
                self.payload.as_slice(),
                options,
                |progress| {
                    if let Some(p) = progress.percent() {
                        percent(p);
                    }
                },
                &ctx.cancel,
            )
            .await?;

        // a table loaded from an earlier version of the file is stale now
        services.engine.unregister_file(&file).await?;

        if ctx.cancel.is_cancelled() {
            services.blobs.delete(&file).await?;
            return Err(DataError::Cancelled);
        }

        let summary = match services
            .engine
            .dataset_summary(&file, &FieldNames::for_api(&self.api))
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(request_id = self.request_id, file = %file, "No dataset summary: {}", e);
                None
            }
        };

        let update = RequestUpdate {
            status: Some(RequestStatus::Success),
            api: Some(self.api.clone()),
            file: Some(file.clone()),
            row_count: Some(info.row_count),
            num_bytes: Some(handle.size),
            end_time: Some(Utc::now()),
            summary: summary.clone(),
            ..Default::default()
        };
        if let Err(e) = services.requests.update(self.request_id, update).await {
            // the record is gone or moved on; don't leave an orphan file
            services.engine.unregister_file(&file).await?;
            services.blobs.delete(&file).await?;
            return Err(e);
        }

        info!(
            request_id = self.request_id,
            file = %file,
            rows = info.row_count,
            bytes = handle.size,
            "Imported dataset"
        );
        Ok(ImportSummary {
            request_id: self.request_id,
            file,
            row_count: info.row_count,
            num_bytes: handle.size,
            summary,
        })
    }
}

#[async_trait]
impl Task for ImportTask {
    type Output = ImportSummary;

    fn operation(&self) -> Operation {
        Operation::Import
    }

    fn request_id(&self) -> Option<RequestId> {
        Some(self.request_id)
    }

    fn destination(&self) -> Option<String> {
        Some(self.file())
    }

    async fn run(self, ctx: TaskContext) -> ps_data::Result<ImportSummary> {
        let result = self.import(&ctx).await;
        if let Err(e) = &result {
            let mark_failed = !matches!(
                e,
                DataError::Cancelled | DataError::NotFound(_) | DataError::InvalidTransition { .. }
            );
            if mark_failed {
                let update = RequestUpdate::status(RequestStatus::Error).with_details(e.to_string());
                if let Err(mark) = ctx.services.requests.update(self.request_id, update).await {
                    warn!(request_id = self.request_id, "Could not mark request failed: {}", mark);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::DestinationPolicy;
    use crate::protocol::WorkerEvent;
    use crate::task::{TaskOutcome, TaskState};
    use crate::tasks::testing::{coordinator, payload};
    use ps_data::ErrorKind;

    #[tokio::test]
    async fn test_import_marks_request_done() {
        let (coordinator, _dir) = coordinator(2, DestinationPolicy::default()).await;
        let requests = &coordinator.services().requests;
        let id = requests.add_pending().await.unwrap();
        let mut events = coordinator.subscribe();

        let handle = coordinator.import(id, "atl03x", payload(500, 3), Some(500));
        let task_id = handle.id();
        let summary = handle.wait().await.completed().unwrap();
        assert_eq!(summary.file, format!("atl03x_{}.arrow", id));
        assert_eq!(summary.row_count, 500);
        let extent = summary.summary.unwrap();
        assert!(extent.min_height <= extent.low_height && extent.high_height <= extent.max_height);

        let record = requests.get(id).await.unwrap();
        assert_eq!(record.status, RequestStatus::Success);
        assert_eq!(record.file.as_deref(), Some(summary.file.as_str()));
        assert_eq!(record.row_count, Some(500));
        assert_eq!(record.num_bytes, Some(summary.num_bytes));

        let mut percents = Vec::new();
        let mut settled = None;
        while let Ok(event) = events.try_recv() {
            match event {
                WorkerEvent::Progress { task_id: t, percent } if t == task_id => percents.push(percent),
                WorkerEvent::Completed { task_id: t } if t == task_id => settled = Some(TaskState::Completed),
                _ => {}
            }
        }
        assert_eq!(settled, Some(TaskState::Completed));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[1] >= w[0] + 5 || w[1] == 100));
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_and_marks_error() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let requests = &coordinator.services().requests;
        let id = requests.add_pending().await.unwrap();

        let outcome = coordinator
            .import(id, "atl06", Arc::new(b"not an arrow file".to_vec()), None)
            .wait()
            .await;
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Corrupt);
        assert_eq!(error.request_id, Some(id));

        let record = requests.get(id).await.unwrap();
        assert_eq!(record.status, RequestStatus::Error);
        assert!(coordinator.services().blobs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_for_missing_request_fails() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let outcome = coordinator.import(42, "atl06", payload(10, 1), None).wait().await;
        assert_eq!(outcome.error().unwrap().kind, ErrorKind::NotFound);
        assert!(coordinator.services().blobs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_import_cancels_the_first() {
        let (coordinator, _dir) = coordinator(2, DestinationPolicy::CancelPrevious).await;
        let id = coordinator.services().requests.add_pending().await.unwrap();

        let first = coordinator.import(id, "atl03x", payload(20_000, 1), None);
        let second = coordinator.import(id, "atl03x", payload(300, 2), None);

        let first = first.wait().await;
        let second = second.wait().await;
        assert!(matches!(first, TaskOutcome::Cancelled | TaskOutcome::Completed(_)));
        let summary = second.completed().unwrap();
        assert_eq!(summary.row_count, 300);

        // the surviving file is the second payload, whole
        let files = coordinator.services().blobs.list().await.unwrap();
        assert_eq!(files, vec![summary.file.clone()]);
        let record = coordinator.services().requests.get(id).await.unwrap();
        assert_eq!(record.row_count, Some(300));
    }

    #[tokio::test]
    async fn test_same_destination_imports_are_serialized() {
        let (coordinator, _dir) = coordinator(2, DestinationPolicy::AwaitPrevious).await;
        let id = coordinator.services().requests.add_pending().await.unwrap();

        let first = coordinator.import(id, "atl06", payload(2_000, 1), None);
        let second = coordinator.import(id, "atl06", payload(700, 2), None);
        assert!(first.wait().await.is_completed());
        let second = second.wait().await.completed().unwrap();
        assert_eq!(second.row_count, 700);
        assert_eq!(
            coordinator.services().requests.get(id).await.unwrap().row_count,
            Some(700)
        );
    }
}
