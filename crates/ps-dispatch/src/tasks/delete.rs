use async_trait::async_trait;
use ps_core::RequestId;
use tracing::info;

use crate::task::{Task, TaskContext};
use crate::Operation;

/// What a delete removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteSummary {
    pub request_id: RequestId,
    pub file: Option<String>,
    pub file_deleted: bool,
    pub record_deleted: bool,
}

/// Removes a request's dataset file, its query table and its record.
/// Missing pieces are skipped, so deleting twice is harmless.
#[derive(Debug, Clone)]
pub struct DeleteTask {
    request_id: RequestId,
    file: Option<String>,
}

impl DeleteTask {
    pub fn new(request_id: RequestId, file: Option<String>) -> Self {
        Self { request_id, file }
    }
}

#[async_trait]
impl Task for DeleteTask {
    type Output = DeleteSummary;

    fn operation(&self) -> Operation {
        Operation::Delete
    }

    fn request_id(&self) -> Option<RequestId> {
        Some(self.request_id)
    }

    fn destination(&self) -> Option<String> {
        self.file.clone()
    }

    async fn run(self, ctx: TaskContext) -> ps_data::Result<DeleteSummary> {
        let services = &ctx.services;
        let mut file_deleted = false;
        if let Some(file) = &self.file {
            services.engine.unregister_file(file).await?;
            file_deleted = services.blobs.delete(file).await?.deleted;
        }
        let record_deleted = services.requests.delete(self.request_id).await?;
        info!(
            request_id = self.request_id,
            file_deleted, record_deleted, "Deleted request"
        );
        Ok(DeleteSummary {
            request_id: self.request_id,
            file: self.file,
            file_deleted,
            record_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::coordinator::DestinationPolicy;
    use crate::tasks::testing::{coordinator, payload};

    #[tokio::test]
    async fn test_delete_cascades_and_is_idempotent() {
        let (coordinator, _dir) = coordinator(1, DestinationPolicy::default()).await;
        let services = coordinator.services().clone();
        let id = services.requests.add_pending().await.unwrap();
        let file = coordinator
            .import(id, "atl06", payload(50, 2), None)
            .wait()
            .await
            .completed()
            .unwrap()
            .file;
        assert!(services.engine.is_registered(&file));

        let summary = coordinator.delete(id).await.wait().await.completed().unwrap();
        assert!(summary.file_deleted && summary.record_deleted);
        assert_eq!(summary.file.as_deref(), Some(file.as_str()));
        assert!(!services.engine.is_registered(&file));
        assert!(services.blobs.list().await.unwrap().is_empty());

        let again = coordinator.delete(id).await.wait().await.completed().unwrap();
        assert!(!again.file_deleted && !again.record_deleted);
    }
}
