//! Core types for the pointscope data-management subsystem
//!
//! This crate holds the shared domain vocabulary used by every other crate:
//! request records and their lifecycle, declarative predicates and query
//! intents, the cross-view filter state, cancellation tokens, settings and
//! the event bus.

pub mod beams;
pub mod cancel;
pub mod events;
pub mod fields;
pub mod filter;
pub mod predicate;
pub mod prefs;
pub mod request;
pub mod settings;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use events::EventBus;
pub use filter::{FilterState, FilterStateManager, FilterSubscriber};
pub use predicate::{Predicate, QueryIntent, SelectIntent, Value};
pub use prefs::{InMemoryPreferences, PreferenceStore};
pub use request::{RequestId, RequestRecord, RequestStatus, RequestUpdate};
pub use settings::CoreSettings;
