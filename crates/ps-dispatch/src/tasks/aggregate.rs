use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use ps_core::{QueryIntent, RequestId};
use tracing::debug;

use crate::task::{Task, TaskContext};
use crate::Operation;

/// Runs a distinct or aggregate query to completion
#[derive(Debug, Clone)]
pub struct AggregateTask {
    request_id: Option<RequestId>,
    files: Vec<String>,
    intent: QueryIntent,
}

impl AggregateTask {
    pub fn new(request_id: Option<RequestId>, files: Vec<String>, intent: QueryIntent) -> Self {
        Self {
            request_id,
            files,
            intent,
        }
    }
}

#[async_trait]
impl Task for AggregateTask {
    type Output = Vec<RecordBatch>;

    fn operation(&self) -> Operation {
        Operation::Aggregate
    }

    fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    async fn run(self, ctx: TaskContext) -> ps_data::Result<Vec<RecordBatch>> {
        let handle = ctx
            .services
            .engine
            .query_intent_with_cancel(&self.files, &self.intent, ctx.cancel.clone())
            .await?;
        let mut rows = handle.read_rows();
        let mut batches = Vec::new();
        while let Some(batch) = rows.next_batch().await {
            let batch = batch?;
            ctx.progress.rows(batch.num_rows() as u64);
            batches.push(batch);
        }
        let stats = rows.finish().await?;
        debug!(task_id = ctx.task_id, rows = stats.rows, "Aggregate finished");
        Ok(batches)
    }
}
