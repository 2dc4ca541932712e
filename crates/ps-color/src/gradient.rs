//! Continuous value to color mapping

use ps_core::prefs::GRADIENT_KEY;
use ps_core::settings::PlotSettings;
use ps_core::PreferenceStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::palette::{self, MIN_SHADES};
use crate::{prefs_error, ColorError, Result};

/// Persisted gradient choice. Colors are regenerated from the name on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradientPreference {
    pub palette: String,
    pub shades: usize,
}

impl Default for GradientPreference {
    fn default() -> Self {
        let plot = PlotSettings::default();
        Self {
            palette: plot.default_gradient,
            shades: plot.default_shades,
        }
    }
}

impl GradientPreference {
    /// Validate a palette name; shade counts below the minimum are raised
    pub fn new(palette: impl Into<String>, shades: usize) -> Result<Self> {
        let palette = palette.into();
        if !palette::is_known(&palette) {
            return Err(ColorError::UnknownPalette(palette));
        }
        Ok(Self {
            palette,
            shades: shades.max(MIN_SHADES),
        })
    }

    pub fn from_settings(plot: &PlotSettings) -> Self {
        Self::new(plot.default_gradient.clone(), plot.default_shades).unwrap_or_default()
    }

    /// Stored preference, or `fallback` when none is stored or it is unusable
    pub fn load(store: &dyn PreferenceStore, fallback: Self) -> Result<Self> {
        let Some(raw) = store.load(GRADIENT_KEY).map_err(prefs_error)? else {
            return Ok(fallback);
        };
        let stored: GradientPreference = serde_json::from_str(&raw)?;
        match Self::new(stored.palette, stored.shades) {
            Ok(pref) => Ok(pref),
            Err(e) => {
                debug!("Ignoring stored gradient preference: {}", e);
                Ok(fallback)
            }
        }
    }

    pub fn save(&self, store: &dyn PreferenceStore) -> Result<()> {
        let raw = serde_json::to_string(self)?;
        store.save(GRADIENT_KEY, &raw).map_err(prefs_error)
    }
}

/// A palette stretched over a value range
#[derive(Debug, Clone, PartialEq)]
pub struct GradientMap {
    preference: GradientPreference,
    colors: Vec<String>,
    min: f64,
    max: f64,
}

impl GradientMap {
    pub fn new(preference: GradientPreference, min: f64, max: f64) -> Result<Self> {
        let colors = palette::generate(&preference.palette, preference.shades)
            .ok_or_else(|| ColorError::UnknownPalette(preference.palette.clone()))?;
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Ok(Self {
            preference,
            colors,
            min,
            max,
        })
    }

    pub fn preference(&self) -> &GradientPreference {
        &self.preference
    }

    pub fn colors(&self) -> &[String] {
        &self.colors
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Palette index for `value`: `floor(((v - min) / (max - min)) * N - 1)`
    /// clamped to `[0, N - 1]`. A zero-width range maps to index 0.
    /// Non-finite values have no index.
    pub fn index_for(&self, value: f64) -> Option<usize> {
        if !value.is_finite() {
            return None;
        }
        let n = self.colors.len();
        let span = self.max - self.min;
        if !span.is_finite() || span <= 0.0 {
            return Some(0);
        }
        let raw = (((value - self.min) / span) * n as f64 - 1.0).floor();
        Some(raw.clamp(0.0, (n - 1) as f64) as usize)
    }

    pub fn color_at(&self, index: usize) -> &str {
        self.colors
            .get(index)
            .map(String::as_str)
            .unwrap_or(palette::FALLBACK_COLOR)
    }

    pub fn color_for(&self, value: f64) -> &str {
        match self.index_for(value) {
            Some(index) => self.color_at(index),
            None => palette::FALLBACK_COLOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_core::InMemoryPreferences;

    fn plasma(shades: usize) -> GradientMap {
        GradientMap::new(GradientPreference::new("plasma", shades).unwrap(), 0.0, 100.0).unwrap()
    }

    #[test]
    fn test_range_endpoints_clamp() {
        let map = plasma(256);
        assert_eq!(map.index_for(0.0), Some(0));
        assert_eq!(map.index_for(100.0), Some(255));
        assert_eq!(map.index_for(-50.0), Some(0));
        assert_eq!(map.index_for(1e9), Some(255));
        assert_eq!(map.color_for(0.0), map.colors()[0]);
        assert_eq!(map.color_for(100.0), map.colors()[255]);
    }

    #[test]
    fn test_bucket_formula() {
        let map = plasma(10);
        // 55% of 10 shades -> floor(5.5 - 1) = 4
        assert_eq!(map.index_for(55.0), Some(4));
        assert_eq!(map.index_for(10.0), Some(0));
        assert_eq!(map.index_for(20.0), Some(1));
    }

    #[test]
    fn test_degenerate_and_non_finite() {
        let map = GradientMap::new(GradientPreference::default(), 5.0, 5.0).unwrap();
        assert_eq!(map.index_for(5.0), Some(0));
        assert_eq!(map.index_for(f64::NAN), None);
        assert_eq!(map.color_for(f64::INFINITY), palette::FALLBACK_COLOR);
    }

    #[test]
    fn test_reversed_range_is_ordered() {
        let map = GradientMap::new(GradientPreference::default(), 10.0, 0.0).unwrap();
        assert_eq!(map.range(), (0.0, 10.0));
    }

    #[test]
    fn test_preference_persistence() {
        let store = InMemoryPreferences::new();
        let fallback = GradientPreference::default();
        assert_eq!(GradientPreference::load(&store, fallback.clone()).unwrap(), fallback);

        let pref = GradientPreference::new("plasma", 256).unwrap();
        pref.save(&store).unwrap();
        assert_eq!(GradientPreference::load(&store, fallback.clone()).unwrap(), pref);

        store.save(GRADIENT_KEY, r#"{"palette":"bogus","shades":64}"#).unwrap();
        assert_eq!(GradientPreference::load(&store, fallback.clone()).unwrap(), fallback);
    }

    #[test]
    fn test_unknown_palette_rejected() {
        assert!(matches!(
            GradientPreference::new("sparkles", 64),
            Err(ColorError::UnknownPalette(_))
        ));
        assert_eq!(GradientPreference::new("viridis", 3).unwrap().shades, MIN_SHADES);
    }
}
