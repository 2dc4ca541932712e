//! Bounded worker pool

use std::sync::Arc;

use ps_core::CancelToken;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A fixed number of worker slots. Waiters are served first come, first
/// served.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Pool with `size` slots; at least one
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a slot. `None` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancelToken) -> Option<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        }
    }
}
