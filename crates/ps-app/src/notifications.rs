//! Dismissible notices for failed background work

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use ps_core::RequestId;
use ps_dispatch::TaskError;
use serde::Serialize;

/// One failure shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: u64,
    pub operation: String,
    pub request_id: Option<RequestId>,
    pub message: String,
    pub created: DateTime<Utc>,
}

impl Notification {
    /// Short headline, e.g. `import failed for request 3`
    pub fn title(&self) -> String {
        match self.request_id {
            Some(id) => format!("{} failed for request {}", self.operation, id),
            None => format!("{} failed", self.operation),
        }
    }
}

/// Open notifications, oldest first
#[derive(Debug, Default)]
pub struct Notifications {
    items: RwLock<Vec<Notification>>,
    next_id: AtomicU64,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, operation: impl Into<String>, request_id: Option<RequestId>, message: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.items.write().push(Notification {
            id,
            operation: operation.into(),
            request_id,
            message: message.into(),
            created: Utc::now(),
        });
        id
    }

    pub fn push_error(&self, error: &TaskError) -> u64 {
        self.push(error.operation.as_str(), error.request_id, error.message.clone())
    }

    pub fn list(&self) -> Vec<Notification> {
        self.items.read().clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Returns whether the notification was still open
    pub fn dismiss(&self, id: u64) -> bool {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|n| n.id != id);
        items.len() != before
    }

    pub fn clear(&self) {
        self.items.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_data::ErrorKind;
    use ps_dispatch::Operation;

    #[test]
    fn test_push_and_dismiss() {
        let notifications = Notifications::new();
        let error = TaskError::new(Operation::Import, Some(4), ErrorKind::StorageFull, "disk full");
        let first = notifications.push_error(&error);
        let second = notifications.push("query", None, "bad column");

        let items = notifications.list();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title(), "import failed for request 4");
        assert_eq!(items[1].title(), "query failed");

        assert!(notifications.dismiss(first));
        assert!(!notifications.dismiss(first));
        assert_eq!(notifications.list()[0].id, second);
        notifications.clear();
        assert!(notifications.is_empty());
    }
}
