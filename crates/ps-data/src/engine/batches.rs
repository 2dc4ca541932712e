//! Pull-based result batches

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use ps_core::CancelToken;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::schema::{arrow_schema, Column};
use crate::Result;

/// Totals reported by a finished producer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub rows: u64,
    pub batches: u64,
}

/// A running query. The schema is known up front; rows are read once
/// through [`QueryHandle::read_rows`].
pub struct QueryHandle {
    pub(crate) columns: Vec<Column>,
    pub(crate) receiver: mpsc::Receiver<Result<RecordBatch>>,
    pub(crate) cancel: CancelToken,
    pub(crate) producer: JoinHandle<Result<QueryStats>>,
}

impl QueryHandle {
    /// Result columns (name and type)
    pub fn schema(&self) -> &[Column] {
        &self.columns
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        arrow_schema(&self.columns)
    }

    /// Token that stops the producer at the next batch boundary
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Consume the handle into its single-pass batch sequence
    pub fn read_rows(self) -> RowBatches {
        RowBatches {
            columns: self.columns,
            receiver: self.receiver,
            cancel: self.cancel,
            producer: Some(self.producer),
        }
    }
}

/// Forward-only, finite sequence of result batches.
///
/// The producer keeps at most one batch buffered ahead of the consumer, so
/// a slow reader holds back the query instead of piling up memory.
/// Dropping the sequence stops the producer.
pub struct RowBatches {
    columns: Vec<Column>,
    receiver: mpsc::Receiver<Result<RecordBatch>>,
    cancel: CancelToken,
    producer: Option<JoinHandle<Result<QueryStats>>>,
}

impl RowBatches {
    pub fn schema(&self) -> &[Column] {
        &self.columns
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        arrow_schema(&self.columns)
    }

    /// Pull the next batch. `None` once the query is exhausted.
    pub async fn next_batch(&mut self) -> Option<Result<RecordBatch>> {
        self.receiver.recv().await
    }

    /// Stop the producer; pending and future reads end the sequence
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drain every remaining batch
    pub async fn collect(mut self) -> Result<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch().await {
            batches.push(batch?);
        }
        self.finish().await?;
        Ok(batches)
    }

    /// Wait for the producer and return its totals
    pub async fn finish(mut self) -> Result<QueryStats> {
        // unread batches are discarded
        while self.receiver.recv().await.is_some() {}
        match self.producer.take() {
            Some(producer) => producer.await?,
            None => Ok(QueryStats::default()),
        }
    }
}

impl Drop for RowBatches {
    fn drop(&mut self) {
        if self.producer.is_some() {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for RowBatches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowBatches")
            .field("columns", &self.columns)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
