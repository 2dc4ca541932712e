//! Service wiring for pointscope
//!
//! [`Explorer`] owns one instance of every storage, query, color and
//! coordination service and exposes the operations renderers and the
//! request workflow call.

pub mod explorer;
pub mod notifications;

pub use explorer::Explorer;
pub use notifications::{Notification, Notifications};
