//! Filter state manager implementation

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{BoundingBox, FilterState, FilterSubscriber, TrackSelection, ValueThreshold, ZoomWindow};
use crate::predicate::{Predicate, QueryIntent, SelectIntent};
use crate::request::RequestId;

/// Shared filter state with change notification.
///
/// Every mutation bumps the version. The derived predicate is cached against
/// the version it was built from, so readers rebuild it at most once per
/// change.
pub struct FilterStateManager {
    state: Arc<RwLock<FilterState>>,
    derived: Mutex<Option<(u64, Predicate)>>,
    subscribers: Arc<RwLock<Vec<Weak<dyn FilterSubscriber>>>>,
}

impl FilterStateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(FilterState::default())),
            derived: Mutex::new(None),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Current state snapshot
    pub fn snapshot(&self) -> FilterState {
        self.state.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    fn mutate(&self, f: impl FnOnce(&mut FilterState)) {
        let mut state = self.state.write();
        f(&mut state);
        state.version += 1;
        drop(state);
        self.notify_subscribers();
    }

    /// Select the primary request and its API
    pub fn set_primary(&self, request_id: Option<RequestId>, api: Option<String>) {
        self.mutate(|state| {
            state.primary = request_id;
            state.api = api;
            if let Some(id) = request_id {
                state.overlays.retain(|o| *o != id);
            }
        });
    }

    pub fn add_overlay(&self, request_id: RequestId) {
        self.mutate(|state| {
            if state.primary != Some(request_id) && !state.overlays.contains(&request_id) {
                state.overlays.push(request_id);
            }
        });
    }

    pub fn remove_overlay(&self, request_id: RequestId) {
        self.mutate(|state| state.overlays.retain(|o| *o != request_id));
    }

    pub fn clear_overlays(&self) {
        self.mutate(|state| state.overlays.clear());
    }

    /// Drop every reference to a deleted request
    pub fn forget_request(&self, request_id: RequestId) {
        let referenced = {
            let state = self.state.read();
            state.primary == Some(request_id) || state.overlays.contains(&request_id)
        };
        if !referenced {
            return;
        }
        self.mutate(|state| {
            if state.primary == Some(request_id) {
                state.primary = None;
                state.api = None;
            }
            state.overlays.retain(|o| *o != request_id);
        });
    }

    pub fn active_requests(&self) -> Vec<RequestId> {
        self.state.read().active_requests()
    }

    pub fn set_tracks(&self, tracks: TrackSelection) {
        self.mutate(|state| state.tracks = tracks);
    }

    /// Edit the track selection in place
    pub fn update_tracks(&self, f: impl FnOnce(&mut TrackSelection)) {
        self.mutate(|state| f(&mut state.tracks));
    }

    pub fn set_region(&self, region: Option<BoundingBox>) {
        self.mutate(|state| state.region = region);
    }

    /// Replace any threshold on the same column
    pub fn set_threshold(&self, threshold: ValueThreshold) {
        self.mutate(|state| {
            state.thresholds.retain(|t| t.column != threshold.column);
            state.thresholds.push(threshold);
        });
    }

    pub fn clear_thresholds(&self) {
        self.mutate(|state| state.thresholds.clear());
    }

    pub fn set_zoom(&self, zoom: ZoomWindow) {
        let zoom = ZoomWindow::new((zoom.x_start, zoom.x_end), (zoom.y_start, zoom.y_end));
        self.mutate(|state| state.zoom = zoom);
    }

    pub fn reset_zoom(&self) {
        self.mutate(|state| state.zoom = ZoomWindow::full());
    }

    pub fn set_large_dataset(&self, large: bool) {
        self.mutate(|state| state.large_dataset = large);
    }

    /// Flag the dataset as large when its row count exceeds `threshold`
    pub fn update_row_count(&self, row_count: u64, threshold: u64) {
        self.set_large_dataset(row_count > threshold);
    }

    pub fn set_axes(&self, x_axis: Option<String>, y_axes: Vec<String>) {
        self.mutate(|state| {
            state.x_axis = x_axis;
            state.y_axes = y_axes;
        });
    }

    /// Predicate for the current selections, rebuilt only after a change
    pub fn predicate(&self) -> Predicate {
        let state = self.state.read();
        let mut derived = self.derived.lock();
        if let Some((version, predicate)) = derived.as_ref() {
            if *version == state.version {
                return predicate.clone();
            }
        }
        let predicate = state.build_predicate();
        debug!(version = state.version, columns = ?predicate.columns(), "Rebuilt filter predicate");
        *derived = Some((state.version, predicate.clone()));
        predicate
    }

    /// Select intent over the current predicate and axes.
    /// Without axes every column is projected.
    pub fn select_intent(&self) -> QueryIntent {
        let predicate = self.predicate();
        let state = self.state.read();
        let mut projection: Vec<String> = state.x_axis.iter().cloned().collect();
        for y in &state.y_axes {
            if !projection.contains(y) {
                projection.push(y.clone());
            }
        }
        QueryIntent::Select(SelectIntent::new(predicate).project(projection))
    }

    /// Subscribe to filter changes
    pub fn subscribe(&self, subscriber: Weak<dyn FilterSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Notify all subscribers of a change
    fn notify_subscribers(&self) {
        let snapshot = self.snapshot();
        let mut subscribers = self.subscribers.write();

        // Remove dead subscribers and notify live ones
        subscribers.retain(|weak| {
            if let Some(subscriber) = weak.upgrade() {
                subscriber.on_filter_change(&snapshot);
                true
            } else {
                false
            }
        });
    }
}

impl Default for FilterStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Recorder {
        last_version: AtomicU64,
    }

    impl FilterSubscriber for Recorder {
        fn on_filter_change(&self, state: &FilterState) {
            self.last_version.store(state.version, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_mutations_bump_version_and_notify() {
        let manager = FilterStateManager::new();
        let recorder = Arc::new(Recorder {
            last_version: AtomicU64::new(0),
        });
        let weak: Weak<dyn FilterSubscriber> = Arc::downgrade(&recorder) as Weak<dyn FilterSubscriber>;
        manager.subscribe(weak);

        manager.set_primary(Some(1), Some("atl06".to_string()));
        manager.add_overlay(2);
        assert_eq!(manager.version(), 2);
        assert_eq!(recorder.last_version.load(Ordering::SeqCst), 2);
        assert_eq!(manager.active_requests(), vec![1, 2]);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let manager = FilterStateManager::new();
        {
            let recorder = Arc::new(Recorder {
                last_version: AtomicU64::new(0),
            });
            manager.subscribe(Arc::downgrade(&recorder) as Weak<dyn FilterSubscriber>);
        }
        manager.set_large_dataset(true);
        assert!(manager.subscribers.read().is_empty());
    }

    #[test]
    fn test_predicate_tracks_version() {
        let manager = FilterStateManager::new();
        assert!(manager.predicate().is_true());

        manager.update_tracks(|t| t.rgts.push(42));
        assert_eq!(manager.predicate(), Predicate::eq("rgt", 42));

        manager.set_threshold(ValueThreshold {
            column: "h_mean".to_string(),
            min: Some(0.0),
            max: None,
        });
        manager.set_threshold(ValueThreshold {
            column: "h_mean".to_string(),
            min: None,
            max: Some(100.0),
        });
        assert_eq!(
            manager.predicate(),
            Predicate::and([Predicate::eq("rgt", 42), Predicate::lte("h_mean", 100.0)])
        );
    }

    #[test]
    fn test_forget_request() {
        let manager = FilterStateManager::new();
        manager.set_primary(Some(5), Some("atl03x".to_string()));
        manager.add_overlay(6);
        let before = manager.version();

        manager.forget_request(9);
        assert_eq!(manager.version(), before);

        manager.forget_request(5);
        let state = manager.snapshot();
        assert_eq!(state.primary, None);
        assert_eq!(state.api, None);
        assert_eq!(state.overlays, vec![6]);
    }

    #[test]
    fn test_large_flag_from_row_count() {
        let manager = FilterStateManager::new();
        manager.update_row_count(50_001, 50_000);
        assert!(manager.snapshot().large_dataset);
        manager.update_row_count(10, 50_000);
        assert!(!manager.snapshot().large_dataset);
    }

    #[test]
    fn test_select_intent_projects_axes() {
        let manager = FilterStateManager::new();
        manager.set_axes(Some("x_atc".to_string()), vec!["h_mean".to_string(), "x_atc".to_string()]);
        match manager.select_intent() {
            QueryIntent::Select(select) => {
                assert_eq!(select.projection, vec!["x_atc".to_string(), "h_mean".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
