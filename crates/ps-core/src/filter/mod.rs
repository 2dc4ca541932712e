//! Cross-view filter state
//!
//! The single source of truth for what every view is currently showing.
//! No I/O happens here: the state is a set of plain values plus a builder
//! that turns them into a [`Predicate`] for the query engine.

mod manager;
mod subscriber;

pub use manager::FilterStateManager;
pub use subscriber::FilterSubscriber;

use serde::{Deserialize, Serialize};

use crate::beams::{spot_predicate, Beam};
use crate::fields::{self, FieldNames};
use crate::predicate::Predicate;
use crate::request::RequestId;

/// Track/beam/cycle selection made in the UI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSelection {
    pub rgts: Vec<i64>,
    pub cycles: Vec<i64>,
    pub beams: Vec<Beam>,
    pub tracks: Vec<i64>,
    pub spots: Vec<i64>,
    pub pairs: Vec<i64>,
    pub sc_orients: Vec<i64>,
}

impl TrackSelection {
    pub fn is_empty(&self) -> bool {
        self.rgts.is_empty()
            && self.cycles.is_empty()
            && self.beams.is_empty()
            && self.tracks.is_empty()
            && self.spots.is_empty()
            && self.pairs.is_empty()
            && self.sc_orients.is_empty()
    }
}

/// Latitude/longitude rectangle, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

/// Optional lower/upper bound on one numeric column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueThreshold {
    pub column: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ValueThreshold {
    fn predicate(&self) -> Predicate {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Predicate::between(&self.column, min, max),
            (Some(min), None) => Predicate::gte(&self.column, min),
            (None, Some(max)) => Predicate::lte(&self.column, max),
            (None, None) => Predicate::True,
        }
    }
}

/// Visible window as fractions of the full extent, per axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomWindow {
    pub x_start: f64,
    pub x_end: f64,
    pub y_start: f64,
    pub y_end: f64,
}

impl Default for ZoomWindow {
    fn default() -> Self {
        Self::full()
    }
}

impl ZoomWindow {
    pub fn full() -> Self {
        Self {
            x_start: 0.0,
            x_end: 1.0,
            y_start: 0.0,
            y_end: 1.0,
        }
    }

    /// Build a window, clamping each bound to [0, 1] and ordering start/end
    pub fn new(x: (f64, f64), y: (f64, f64)) -> Self {
        let (x_start, x_end) = normalize_fraction(x);
        let (y_start, y_end) = normalize_fraction(y);
        Self {
            x_start,
            x_end,
            y_start,
            y_end,
        }
    }

    pub fn is_full(&self) -> bool {
        *self == Self::full()
    }

    /// Map the X window onto a concrete value range
    pub fn x_range(&self, min: f64, max: f64) -> (f64, f64) {
        scale(min, max, self.x_start, self.x_end)
    }

    pub fn y_range(&self, min: f64, max: f64) -> (f64, f64) {
        scale(min, max, self.y_start, self.y_end)
    }
}

fn normalize_fraction((a, b): (f64, f64)) -> (f64, f64) {
    let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    let (a, b) = (clamp(a), clamp(b));
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn scale(min: f64, max: f64, start: f64, end: f64) -> (f64, f64) {
    let span = max - min;
    (min + span * start, min + span * end)
}

/// Snapshot of everything the views share
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    /// Bumped on every change
    pub version: u64,
    pub primary: Option<RequestId>,
    /// API of the primary request, picks the field mapping
    pub api: Option<String>,
    pub overlays: Vec<RequestId>,
    pub tracks: TrackSelection,
    pub region: Option<BoundingBox>,
    pub thresholds: Vec<ValueThreshold>,
    pub zoom: ZoomWindow,
    pub large_dataset: bool,
    pub x_axis: Option<String>,
    pub y_axes: Vec<String>,
}

impl FilterState {
    /// Primary request first, then overlays, without duplicates
    pub fn active_requests(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.primary.into_iter().collect();
        for id in &self.overlays {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    pub fn field_names(&self) -> FieldNames {
        self.api
            .as_deref()
            .map(FieldNames::for_api)
            .unwrap_or_default()
    }

    /// Turn the current selections into a declarative predicate
    pub fn build_predicate(&self) -> Predicate {
        let tracks = &self.tracks;
        let mut terms = Vec::new();

        if !tracks.rgts.is_empty() {
            terms.push(Predicate::is_in(fields::RGT, tracks.rgts.iter().copied()));
        }
        if !tracks.cycles.is_empty() {
            terms.push(Predicate::is_in(fields::CYCLE, tracks.cycles.iter().copied()));
        }
        if !tracks.beams.is_empty() {
            terms.push(Predicate::is_in(fields::GT, tracks.beams.iter().map(Beam::code)));
        }
        if !tracks.tracks.is_empty() {
            terms.push(Predicate::is_in(fields::TRACK, tracks.tracks.iter().copied()));
        }
        if !tracks.spots.is_empty() {
            // photon-level datasets carry no spot column
            let derive = self.api.as_deref().map_or(false, |api| api.starts_with("atl03"));
            if derive {
                terms.push(spot_predicate(&tracks.spots));
            } else {
                terms.push(Predicate::is_in(fields::SPOT, tracks.spots.iter().copied()));
            }
        }
        if !tracks.pairs.is_empty() {
            terms.push(Predicate::is_in(fields::PAIR, tracks.pairs.iter().copied()));
        }
        if !tracks.sc_orients.is_empty() {
            terms.push(Predicate::is_in(fields::SC_ORIENT, tracks.sc_orients.iter().copied()));
        }

        if let Some(region) = &self.region {
            let names = self.field_names();
            terms.push(Predicate::between(names.lat, region.min_lat, region.max_lat));
            terms.push(Predicate::between(names.lon, region.min_lon, region.max_lon));
        }

        terms.extend(self.thresholds.iter().map(ValueThreshold::predicate));

        Predicate::and(terms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_state_matches_everything() {
        assert!(FilterState::default().build_predicate().is_true());
    }

    #[test]
    fn test_predicate_from_selection() {
        let state = FilterState {
            api: Some("atl06".to_string()),
            tracks: TrackSelection {
                rgts: vec![42],
                cycles: vec![3, 4],
                spots: vec![2],
                ..Default::default()
            },
            region: Some(BoundingBox {
                min_lat: 10.0,
                max_lat: 20.0,
                min_lon: -5.0,
                max_lon: 5.0,
            }),
            ..Default::default()
        };

        let expected = Predicate::and([
            Predicate::eq("rgt", 42),
            Predicate::is_in("cycle", [3, 4]),
            Predicate::eq("spot", 2),
            Predicate::between("latitude", 10.0, 20.0),
            Predicate::between("longitude", -5.0, 5.0),
        ]);
        assert_eq!(state.build_predicate(), expected);
    }

    #[test]
    fn test_photon_spots_are_derived() {
        let state = FilterState {
            api: Some("atl03x".to_string()),
            tracks: TrackSelection {
                spots: vec![1],
                ..Default::default()
            },
            ..Default::default()
        };
        let predicate = state.build_predicate();
        assert!(predicate.columns().contains(&"sc_orient"));
        assert!(!predicate.columns().contains(&"spot"));
    }

    #[test]
    fn test_zoom_window_is_clamped_and_ordered() {
        let zoom = ZoomWindow::new((0.8, 0.2), (-1.0, 2.0));
        assert_eq!(zoom.x_start, 0.2);
        assert_eq!(zoom.x_end, 0.8);
        assert_eq!(zoom.y_start, 0.0);
        assert_eq!(zoom.y_end, 1.0);
        assert_eq!(zoom.x_range(0.0, 100.0), (20.0, 80.0));
    }

    #[test]
    fn test_state_survives_json() {
        let state = FilterState {
            version: 4,
            primary: Some(7),
            api: Some("atl03x".to_string()),
            tracks: TrackSelection {
                beams: vec![Beam::Gt1l, Beam::Gt3r],
                tracks: vec![2],
                ..Default::default()
            },
            zoom: ZoomWindow::new((0.1, 0.5), (0.0, 1.0)),
            large_dataset: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"gt1l\""));
        let back: FilterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.build_predicate(), state.build_predicate());
    }

    #[test]
    fn test_active_requests_deduplicates() {
        let state = FilterState {
            primary: Some(1),
            overlays: vec![2, 1, 3],
            ..Default::default()
        };
        assert_eq!(state.active_requests(), vec![1, 2, 3]);
    }
}
