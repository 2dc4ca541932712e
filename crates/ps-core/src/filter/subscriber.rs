//! Filter subscriber trait

use super::FilterState;

/// Trait for views that need to respond to filter changes
pub trait FilterSubscriber: Send + Sync {
    /// Called after every change with the new snapshot
    fn on_filter_change(&self, state: &FilterState);
}
