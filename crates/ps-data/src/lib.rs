//! Local storage and query services for pointscope
//!
//! Dataset files live in a quota-bounded [`BlobStore`], request metadata and
//! preferences live in one SQLite database, and the [`QueryEngine`] makes
//! stored datasets queryable as SQL tables streamed back in Arrow batches.

pub mod blob;
pub mod dataset;
pub mod db;
pub mod engine;
pub mod export;
pub mod prefs;
pub mod requests;
pub mod schema;
pub mod synthetic;

use arrow::error::ArrowError;
use ps_core::{RequestId, RequestStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;

// Re-exports
pub use blob::{BlobHandle, BlobStore, DeleteOutcome, QuotaInfo, WriteOptions, WriteProgress};
pub use dataset::DatasetInfo;
pub use db::Database;
pub use engine::{QueryEngine, QueryHandle, RowBatches};
pub use export::CsvExporter;
pub use prefs::SqlitePreferences;
pub use requests::{RequestChange, RequestStore, RequestSubscriber};
pub use schema::{Column, ColumnType};

/// Errors that can occur in storage and query operations
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Storage full: {needed} bytes requested, {available} available")]
    StorageFull { needed: u64, available: u64 },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Query syntax error: {0}")]
    QuerySyntax(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Query engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Write conflict: {0} is already being written")]
    WriteConflict(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Corrupt dataset {name}: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("Dataset {0} is still being written")]
    NotYetAvailable(String),

    #[error("Request {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(ArrowError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Join error: {0}")]
    Join(#[from] JoinError),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<csv::Error> for DataError {
    fn from(error: csv::Error) -> Self {
        match error.kind() {
            csv::ErrorKind::Io(io_err) => {
                DataError::Io(std::io::Error::new(io_err.kind(), error.to_string()))
            }
            _ => DataError::Csv(error.to_string()),
        }
    }
}

impl From<ArrowError> for DataError {
    fn from(error: ArrowError) -> Self {
        match error {
            ArrowError::IoError(msg, io_err) => {
                DataError::Io(std::io::Error::new(io_err.kind(), msg))
            }
            other => DataError::Arrow(other),
        }
    }
}

/// Coarse error classification carried across worker boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StorageFull,
    StorageUnavailable,
    NotFound,
    QuerySyntax,
    TableNotFound,
    EngineUnavailable,
    WriteConflict,
    Cancelled,
    Corrupt,
    NotYetAvailable,
    InvalidTransition,
    InvalidUpdate,
    Io,
    /// A worker command failed validation before it ran
    InvalidCommand,
    Internal,
}

impl DataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::StorageFull { .. } => ErrorKind::StorageFull,
            DataError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            DataError::NotFound(_) => ErrorKind::NotFound,
            DataError::QuerySyntax(_) => ErrorKind::QuerySyntax,
            DataError::TableNotFound(_) => ErrorKind::TableNotFound,
            DataError::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            DataError::WriteConflict(_) => ErrorKind::WriteConflict,
            DataError::Cancelled => ErrorKind::Cancelled,
            DataError::Corrupt { .. } => ErrorKind::Corrupt,
            DataError::NotYetAvailable(_) => ErrorKind::NotYetAvailable,
            DataError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DataError::InvalidUpdate(_) => ErrorKind::InvalidUpdate,
            DataError::Io(_) => ErrorKind::Io,
            DataError::Arrow(_)
            | DataError::Sqlite(_)
            | DataError::Csv(_)
            | DataError::Json(_)
            | DataError::Join(_)
            | DataError::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DataError::Cancelled)
    }
}

pub type Result<T, E = DataError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(DataError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            DataError::StorageFull {
                needed: 10,
                available: 1
            }
            .kind(),
            ErrorKind::StorageFull
        );
        assert_eq!(DataError::Other("x".into()).kind(), ErrorKind::Internal);
        assert!(DataError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_csv_io_errors_become_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: DataError = csv::Error::from(io).into();
        assert!(matches!(err, DataError::Io(_)));
    }
}
