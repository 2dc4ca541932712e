//! Per-dataset resolved color caches

use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::{Array, Float64Array, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use ps_core::{RequestId, Value};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::classification::ClassificationTable;
use crate::gradient::GradientMap;
use crate::palette::FALLBACK_COLOR;
use crate::{ColorError, Result};

/// Batches shorter than this are colorized on the calling thread
const PARALLEL_ROWS: usize = 16_384;

/// What a cache resolves values against
#[derive(Debug, Clone, PartialEq)]
pub enum ColorSource {
    Classification(ClassificationTable),
    Gradient(GradientMap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    Code(i64),
    Bits(u64),
}

/// Value to color cache for one color-mapped column of one dataset.
///
/// Resolved colors are kept until the palette, the classification table or
/// the column layout changes; each of those bumps [`ColorCache::version`].
#[derive(Debug)]
pub struct ColorCache {
    request_id: RequestId,
    column: String,
    source: ColorSource,
    data_order: AHashMap<String, usize>,
    column_index: Option<usize>,
    resolved: AHashMap<CacheKey, Arc<str>>,
    fallback: Arc<str>,
    warned: bool,
    version: u64,
}

impl ColorCache {
    pub fn new(request_id: RequestId, column: impl Into<String>, source: ColorSource) -> Self {
        Self {
            request_id,
            column: column.into(),
            source,
            data_order: AHashMap::new(),
            column_index: None,
            resolved: AHashMap::new(),
            fallback: Arc::from(FALLBACK_COLOR),
            warned: false,
            version: 0,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn source(&self) -> &ColorSource {
        &self.source
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of distinct values resolved since the last invalidation
    pub fn cached_len(&self) -> usize {
        self.resolved.len()
    }

    /// Record the positional layout of rows about to be colorized.
    /// Only the column index is forgotten; resolved colors stay valid.
    pub fn set_data_order_ndx(&mut self, mapping: AHashMap<String, usize>) {
        self.data_order = mapping;
        self.column_index = None;
    }

    /// Position of the color-mapped column, resolved on first use after a
    /// layout change
    pub fn column_index(&mut self) -> Option<usize> {
        if self.column_index.is_none() {
            self.column_index = self.data_order.get(&self.column).copied();
        }
        self.column_index
    }

    /// Color for one value. Never fails: values the map does not cover get
    /// the fallback color.
    pub fn color_for(&mut self, value: &Value) -> Arc<str> {
        let Some(key) = self.key_for(value) else {
            return self.fallback_for(value);
        };
        if let Some(color) = self.resolved.get(&key) {
            return color.clone();
        }
        let resolved = match (&self.source, key) {
            (ColorSource::Classification(table), CacheKey::Code(code)) => {
                table.color(code).map(Arc::<str>::from)
            }
            (ColorSource::Gradient(map), CacheKey::Bits(bits)) => map
                .index_for(f64::from_bits(bits))
                .map(|i| Arc::<str>::from(map.color_at(i))),
            _ => None,
        };
        match resolved {
            Some(color) => {
                self.resolved.insert(key, color.clone());
                color
            }
            None => self.fallback_for(value),
        }
    }

    fn key_for(&self, value: &Value) -> Option<CacheKey> {
        match self.source {
            ColorSource::Classification(_) => value.as_i64().map(CacheKey::Code),
            ColorSource::Gradient(_) => value
                .as_f64()
                .filter(|v| v.is_finite())
                // +0.0 and -0.0 share a bucket
                .map(|v| CacheKey::Bits((v + 0.0).to_bits())),
        }
    }

    fn fallback_for(&mut self, value: &Value) -> Arc<str> {
        if !self.warned {
            warn!(
                request_id = self.request_id,
                column = %self.column,
                "No color defined for value {}, using {}",
                value,
                FALLBACK_COLOR
            );
            self.warned = true;
        }
        self.fallback.clone()
    }

    /// Color of one row of a record batch laid out per the data order
    pub fn color_for_row(&mut self, batch: &RecordBatch, row: usize) -> Result<Arc<str>> {
        let values = self.column_values(batch)?;
        Ok(self.color_for(&values.value(row)))
    }

    /// Colors for every row of `batch`
    pub fn colorize_batch(&mut self, batch: &RecordBatch) -> Result<Vec<Arc<str>>> {
        let values = self.column_values(batch)?;
        let rows = batch.num_rows();
        if let (ColorSource::Gradient(map), ColumnValues::Float(array)) = (&self.source, &values) {
            if rows >= PARALLEL_ROWS {
                let indices: Vec<Option<usize>> = (0..rows)
                    .into_par_iter()
                    .map(|row| {
                        if array.is_null(row) {
                            None
                        } else {
                            map.index_for(array.value(row))
                        }
                    })
                    .collect();
                let palette: Vec<Arc<str>> =
                    map.colors().iter().map(|c| Arc::<str>::from(c.as_str())).collect();
                let mut misses = 0usize;
                let colors = indices
                    .into_iter()
                    .map(|index| match index {
                        Some(i) => palette[i].clone(),
                        None => {
                            misses += 1;
                            self.fallback.clone()
                        }
                    })
                    .collect();
                if misses > 0 && !self.warned {
                    warn!(request_id = self.request_id, column = %self.column, "{} values without a color", misses);
                    self.warned = true;
                }
                debug!("Colorized {} rows in parallel", rows);
                return Ok(colors);
            }
        }
        Ok((0..rows).map(|row| self.color_for(&values.value(row))).collect())
    }

    fn column_values(&mut self, batch: &RecordBatch) -> Result<ColumnValues> {
        let index = match self.column_index() {
            Some(index) => index,
            // with no layout recorded, find the column by name
            None if self.data_order.is_empty() => batch
                .schema()
                .index_of(&self.column)
                .map_err(|_| ColorError::UnknownColumn(self.column.clone()))?,
            None => return Err(ColorError::UnknownColumn(self.column.clone())),
        };
        if index >= batch.num_columns() {
            return Err(ColorError::UnknownColumn(self.column.clone()));
        }
        let column = batch.column(index);
        Ok(match self.source {
            ColorSource::Classification(_) => {
                let cast = cast(column.as_ref(), &DataType::Int64)?;
                ColumnValues::Int(downcast::<Int64Array>(cast.as_ref())?)
            }
            ColorSource::Gradient(_) => {
                let cast = cast(column.as_ref(), &DataType::Float64)?;
                ColumnValues::Float(downcast::<Float64Array>(cast.as_ref())?)
            }
        })
    }

    /// Replace a classification color and drop every resolved color
    pub fn set_color(&mut self, code: i64, color: impl Into<String>) -> Result<()> {
        match &mut self.source {
            ColorSource::Classification(table) => table.set_color(code, color)?,
            ColorSource::Gradient(_) => {
                return Err(ColorError::UnknownFamily(self.column.clone()));
            }
        }
        self.invalidate();
        Ok(())
    }

    pub fn restore_defaults(&mut self) {
        if let ColorSource::Classification(table) = &mut self.source {
            table.restore_defaults();
        }
        self.invalidate();
    }

    /// Swap the map values resolve against
    pub fn set_source(&mut self, source: ColorSource) {
        self.source = source;
        self.invalidate();
    }

    /// Forget every resolved color and the column index
    pub fn invalidate(&mut self) {
        self.resolved.clear();
        self.column_index = None;
        self.warned = false;
        self.version += 1;
        debug!(request_id = self.request_id, column = %self.column, "Color cache reset");
    }
}

enum ColumnValues {
    Int(Int64Array),
    Float(Float64Array),
}

impl ColumnValues {
    fn value(&self, row: usize) -> Value {
        match self {
            ColumnValues::Int(a) if a.is_valid(row) => Value::Int(a.value(row)),
            ColumnValues::Float(a) if a.is_valid(row) => Value::Float(a.value(row)),
            _ => Value::Null,
        }
    }
}

fn downcast<A: Array + Clone + 'static>(array: &dyn Array) -> Result<A> {
    array
        .as_any()
        .downcast_ref::<A>()
        .cloned()
        .ok_or_else(|| {
            ColorError::Arrow(arrow::error::ArrowError::CastError(format!(
                "unexpected array type {}",
                array.data_type()
            )))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::ClassificationFamily;
    use crate::gradient::GradientPreference;
    use arrow::array::{Int8Array, UInt8Array};
    use arrow::datatypes::{Field, Schema};

    fn class_cache() -> ColorCache {
        ColorCache::new(
            1,
            "atl08_class",
            ColorSource::Classification(ClassificationTable::with_defaults(
                ClassificationFamily::Atl08Class,
            )),
        )
    }

    fn gradient_cache(min: f64, max: f64, shades: usize) -> ColorCache {
        let map = GradientMap::new(GradientPreference::new("plasma", shades).unwrap(), min, max).unwrap();
        ColorCache::new(1, "height", ColorSource::Gradient(map))
    }

    #[test]
    fn test_classification_lookup_and_fallback() {
        let mut cache = class_cache();
        assert_eq!(&*cache.color_for(&Value::Int(1)), "violet");
        assert_eq!(&*cache.color_for(&Value::Float(2.0)), "lightgreen");
        assert_eq!(&*cache.color_for(&Value::Int(99)), FALLBACK_COLOR);
        assert_eq!(&*cache.color_for(&Value::Float(1.5)), FALLBACK_COLOR);
        assert_eq!(&*cache.color_for(&Value::Null), FALLBACK_COLOR);
        assert_eq!(cache.cached_len(), 2);
    }

    #[test]
    fn test_set_color_invalidates_every_entry() {
        let mut cache = class_cache();
        assert_eq!(&*cache.color_for(&Value::Int(0)), "blue");
        assert_eq!(&*cache.color_for(&Value::Int(3)), "green");
        let before = cache.version();

        cache.set_color(3, "red").unwrap();
        assert_eq!(cache.cached_len(), 0);
        assert!(cache.version() > before);
        assert_eq!(&*cache.color_for(&Value::Int(3)), "red");
        assert_eq!(&*cache.color_for(&Value::Int(0)), "blue");

        cache.restore_defaults();
        assert_eq!(&*cache.color_for(&Value::Int(3)), "green");
    }

    #[test]
    fn test_data_order_resets_only_the_index() {
        let mut cache = class_cache();
        let _ = cache.color_for(&Value::Int(0));
        cache.set_data_order_ndx([("height".to_string(), 0), ("atl08_class".to_string(), 1)].into_iter().collect());
        assert_eq!(cache.cached_len(), 1);
        assert_eq!(cache.column_index(), Some(1));
        cache.set_data_order_ndx([("atl08_class".to_string(), 0)].into_iter().collect());
        assert_eq!(cache.column_index(), Some(0));
        assert_eq!(cache.cached_len(), 1);
    }

    #[test]
    fn test_gradient_endpoints() {
        let mut cache = gradient_cache(0.0, 10.0, 256);
        let colors = match cache.source() {
            ColorSource::Gradient(map) => map.colors().to_vec(),
            _ => unreachable!(),
        };
        assert_eq!(&*cache.color_for(&Value::Float(0.0)), colors[0]);
        assert_eq!(&*cache.color_for(&Value::Float(10.0)), colors[255]);
        assert_eq!(&*cache.color_for(&Value::Int(50)), colors[255]);
        assert_eq!(&*cache.color_for(&Value::Float(f64::NAN)), FALLBACK_COLOR);
    }

    #[test]
    fn test_colorize_batch_uses_data_order() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("atl03_cnf", DataType::Int8, false),
            Field::new("atl08_class", DataType::UInt8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int8Array::from(vec![4, 4, 4])),
                Arc::new(UInt8Array::from(vec![Some(1), None, Some(7)])),
            ],
        )
        .unwrap();

        let mut cache = class_cache();
        let colors = cache.colorize_batch(&batch).unwrap();
        let colors: Vec<&str> = colors.iter().map(|c| &**c).collect();
        assert_eq!(colors, vec!["violet", FALLBACK_COLOR, FALLBACK_COLOR]);

        cache.set_data_order_ndx([("atl08_class".to_string(), 0)].into_iter().collect());
        // column 0 is now read as the classification column
        assert_eq!(&*cache.color_for_row(&batch, 0).unwrap(), "slategray");

        cache.set_data_order_ndx([("height".to_string(), 0)].into_iter().collect());
        assert!(matches!(cache.colorize_batch(&batch), Err(ColorError::UnknownColumn(_))));
    }

    #[test]
    fn test_parallel_gradient_matches_serial() {
        let rows = PARALLEL_ROWS + 10;
        let values: Vec<f64> = (0..rows).map(|i| i as f64).collect();
        let schema = Arc::new(Schema::new(vec![Field::new("height", DataType::Float64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Float64Array::from(values))]).unwrap();

        let mut parallel = gradient_cache(0.0, rows as f64, 64);
        let colors = parallel.colorize_batch(&batch).unwrap();
        let mut serial = gradient_cache(0.0, rows as f64, 64);
        for row in [0, 1, rows / 2, rows - 1] {
            assert_eq!(colors[row], serial.color_for(&Value::Float(row as f64)));
        }
    }
}
