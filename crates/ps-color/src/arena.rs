//! Owner of every open dataset's color caches

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use ps_core::events::events::PaletteChanged;
use ps_core::prefs::GRADIENT_KEY;
use ps_core::{EventBus, PreferenceStore, RequestId, Value};
use tracing::{debug, info};

use crate::cache::{ColorCache, ColorSource};
use crate::classification::{ClassificationFamily, ClassificationTable};
use crate::gradient::{GradientMap, GradientPreference};
use crate::palette::FALLBACK_COLOR;
use crate::Result;

pub type SharedCache = Arc<Mutex<ColorCache>>;

/// Color caches keyed by `(request id, column)`.
///
/// Every pair owns its cache; nothing mutable is shared between datasets.
/// Classification overrides are persisted per family, so a cache created
/// later starts from the most recently saved colors.
pub struct ColorCacheArena {
    prefs: Arc<dyn PreferenceStore>,
    gradient: RwLock<GradientPreference>,
    caches: RwLock<AHashMap<(RequestId, String), SharedCache>>,
    events: Option<Arc<EventBus>>,
}

impl ColorCacheArena {
    /// Load the stored gradient preference, falling back to `default_gradient`
    pub fn new(prefs: Arc<dyn PreferenceStore>, default_gradient: GradientPreference) -> Result<Self> {
        let gradient = GradientPreference::load(prefs.as_ref(), default_gradient)?;
        Ok(Self {
            prefs,
            gradient: RwLock::new(gradient),
            caches: RwLock::new(AHashMap::new()),
            events: None,
        })
    }

    /// Publish [`PaletteChanged`] on `bus` after palette edits
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn gradient(&self) -> GradientPreference {
        self.gradient.read().clone()
    }

    /// Cache for a classification column, created on first use
    pub fn classification_cache(
        &self,
        request_id: RequestId,
        family: ClassificationFamily,
    ) -> Result<SharedCache> {
        let key = (request_id, family.column().to_string());
        if let Some(cache) = self.caches.read().get(&key) {
            return Ok(cache.clone());
        }
        let table = ClassificationTable::load(family, self.prefs.as_ref())?;
        let mut caches = self.caches.write();
        let cache = caches.entry(key).or_insert_with(|| {
            debug!(request_id, family = family.column(), "Creating classification cache");
            Arc::new(Mutex::new(ColorCache::new(
                request_id,
                family.column(),
                ColorSource::Classification(table),
            )))
        });
        Ok(cache.clone())
    }

    /// Cache for a continuous column over `[min, max]`. An existing cache
    /// with a different range is re-pointed at the new range.
    pub fn gradient_cache(
        &self,
        request_id: RequestId,
        column: &str,
        min: f64,
        max: f64,
    ) -> Result<SharedCache> {
        let map = GradientMap::new(self.gradient(), min, max)?;
        let key = (request_id, column.to_string());
        let mut caches = self.caches.write();
        if let Some(cache) = caches.get(&key) {
            let mut guard = cache.lock();
            let same = matches!(guard.source(), ColorSource::Gradient(current) if *current == map);
            if !same {
                guard.set_source(ColorSource::Gradient(map));
            }
            drop(guard);
            return Ok(cache.clone());
        }
        let cache = Arc::new(Mutex::new(ColorCache::new(
            request_id,
            column,
            ColorSource::Gradient(map),
        )));
        caches.insert(key, cache.clone());
        Ok(cache)
    }

    pub fn get(&self, request_id: RequestId, column: &str) -> Option<SharedCache> {
        self.caches.read().get(&(request_id, column.to_string())).cloned()
    }

    /// Color of `value` in `column` of a dataset. Classification columns get
    /// a cache on demand; other columns use their gradient cache if one
    /// exists. Anything else gets the fallback color.
    pub fn color_for(&self, request_id: RequestId, column: &str, value: &Value) -> Arc<str> {
        let cache = match ClassificationFamily::from_column(column) {
            Some(family) => self.classification_cache(request_id, family).ok(),
            None => self.get(request_id, column),
        };
        match cache {
            Some(cache) => cache.lock().color_for(value),
            None => Arc::from(FALLBACK_COLOR),
        }
    }

    /// Override one classification color for a dataset and persist it
    pub fn set_color(
        &self,
        request_id: RequestId,
        family: ClassificationFamily,
        code: i64,
        color: &str,
    ) -> Result<()> {
        let cache = self.classification_cache(request_id, family)?;
        let mut guard = cache.lock();
        guard.set_color(code, color)?;
        if let ColorSource::Classification(table) = guard.source() {
            table.save(self.prefs.as_ref())?;
        }
        drop(guard);
        self.palette_changed(family.column());
        Ok(())
    }

    /// Restore a family's default colors for a dataset and persist them
    pub fn restore_defaults(&self, request_id: RequestId, family: ClassificationFamily) -> Result<()> {
        let cache = self.classification_cache(request_id, family)?;
        let mut guard = cache.lock();
        guard.restore_defaults();
        if let ColorSource::Classification(table) = guard.source() {
            table.save(self.prefs.as_ref())?;
        }
        drop(guard);
        self.palette_changed(family.column());
        Ok(())
    }

    /// Switch the gradient palette. Every gradient cache is rebuilt over
    /// its current range.
    pub fn set_gradient(&self, preference: GradientPreference) -> Result<()> {
        // validates the name before anything is stored
        let preference = GradientPreference::new(preference.palette, preference.shades)?;
        preference.save(self.prefs.as_ref())?;
        *self.gradient.write() = preference.clone();

        for cache in self.caches.read().values() {
            let mut guard = cache.lock();
            let range = match guard.source() {
                ColorSource::Gradient(map) => map.range(),
                ColorSource::Classification(_) => continue,
            };
            guard.set_source(ColorSource::Gradient(GradientMap::new(
                preference.clone(),
                range.0,
                range.1,
            )?));
        }
        info!("Gradient set to {} with {} shades", preference.palette, preference.shades);
        self.palette_changed(GRADIENT_KEY);
        Ok(())
    }

    /// Drop every cache owned by a request. Returns how many were dropped.
    pub fn evict_request(&self, request_id: RequestId) -> usize {
        let mut caches = self.caches.write();
        let before = caches.len();
        caches.retain(|(id, _), _| *id != request_id);
        let evicted = before - caches.len();
        if evicted > 0 {
            debug!(request_id, evicted, "Evicted color caches");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    fn palette_changed(&self, family: &str) {
        if let Some(bus) = &self.events {
            bus.publish(PaletteChanged {
                family: family.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for ColorCacheArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColorCacheArena")
            .field("gradient", &*self.gradient.read())
            .field("caches", &self.len())
            .finish()
    }
}
