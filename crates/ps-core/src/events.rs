//! In-process event bus
//!
//! Handlers run synchronously on the publishing thread while the handler
//! table is locked, so a handler must not publish.

use std::any::TypeId;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

/// System-wide event bus
pub struct EventBus {
    handlers: Arc<Mutex<AHashMap<TypeId, Vec<Box<dyn EventHandler>>>>>,
}

/// Event trait that all events must implement
pub trait Event: Send + Sync + 'static {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Handler trait for event handlers
pub trait EventHandler: Send + Sync {
    fn handle(&mut self, event: &dyn Event);
}

/// Events published by the data-management services
pub mod events {
    use super::Event;
    use crate::request::RequestId;

    /// A request record was added, updated or deleted
    #[derive(Debug, Clone)]
    pub struct RequestsChanged {
        pub request_id: RequestId,
    }

    /// A dataset file finished importing
    #[derive(Debug, Clone)]
    pub struct DatasetImported {
        pub request_id: RequestId,
        pub file: String,
        pub row_count: u64,
    }

    /// A background task failed
    #[derive(Debug, Clone)]
    pub struct TaskFailed {
        pub request_id: Option<RequestId>,
        pub operation: String,
        pub message: String,
    }

    /// A background task was cancelled
    #[derive(Debug, Clone)]
    pub struct TaskCancelled {
        pub request_id: Option<RequestId>,
        pub operation: String,
    }

    /// A classification table or gradient changed
    #[derive(Debug, Clone)]
    pub struct PaletteChanged {
        pub family: String,
    }

    /// Per-request state was dropped after the request was deleted
    #[derive(Debug, Clone)]
    pub struct RequestEvicted {
        pub request_id: RequestId,
    }

    macro_rules! impl_event {
        ($($t:ty),*) => {
            $(
                impl Event for $t {
                    fn as_any(&self) -> &dyn std::any::Any {
                        self
                    }
                }
            )*
        }
    }

    impl_event!(
        RequestsChanged,
        DatasetImported,
        TaskFailed,
        TaskCancelled,
        PaletteChanged,
        RequestEvicted
    );
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<E: Event>(&self, handler: Box<dyn EventHandler>) {
        let type_id = TypeId::of::<E>();
        let mut handlers = self.handlers.lock();
        handlers.entry(type_id).or_default().push(handler);
    }

    /// Publish an event to every handler registered for its type
    pub fn publish<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let mut handlers = self.handlers.lock();

        if let Some(event_handlers) = handlers.get_mut(&type_id) {
            for handler in event_handlers.iter_mut() {
                handler.handle(&event);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter turning a closure into an [`EventHandler`]
pub struct ClosureEventHandler<F> {
    handler: F,
}

impl<F> EventHandler for ClosureEventHandler<F>
where
    F: FnMut(&dyn Event) + Send + Sync,
{
    fn handle(&mut self, event: &dyn Event) {
        (self.handler)(event);
    }
}

/// Create an event handler from a closure
pub fn handler_from_fn<F>(f: F) -> Box<dyn EventHandler>
where
    F: FnMut(&dyn Event) + Send + Sync + 'static,
{
    Box::new(ClosureEventHandler { handler: f })
}
