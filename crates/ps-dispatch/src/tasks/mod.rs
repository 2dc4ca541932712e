//! The background tasks the coordinator runs

mod aggregate;
mod delete;
mod import;

pub use aggregate::AggregateTask;
pub use delete::{DeleteSummary, DeleteTask};
pub use import::{ImportSummary, ImportTask};
