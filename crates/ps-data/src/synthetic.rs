//! Deterministic altimetry-like datasets for demos and tests

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float64Array, Int16Array, Int32Array, Int8Array, TimestampNanosecondArray, UInt8Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use ps_core::beams::{ground_track, spot_number};

use crate::dataset::{encode_dataset, RECORDINFO_KEY, SRCTBL_KEY};
use crate::Result;

const ATL03_CNF_CODES: [i8; 7] = [-2, -1, 0, 1, 2, 3, 4];
const ATL08_CLASS_CODES: [u8; 5] = [0, 1, 2, 3, 4];
const ATL24_CLASS_CODES: [u8; 3] = [0, 40, 41];
const GRANULES: [&str; 2] = [
    "ATL03_20200101000000_00010601_006_01.h5",
    "ATL03_20200102000000_00020601_006_01.h5",
];

/// Shape of a generated dataset
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSpec {
    pub rows: usize,
    pub seed: u64,
    pub rgt: Option<i32>,
    pub cycle: i16,
    pub batch_rows: usize,
}

impl SyntheticSpec {
    pub fn new(rows: usize, seed: u64) -> Self {
        Self {
            rows,
            seed,
            rgt: None,
            cycle: 10,
            batch_rows: 4_096,
        }
    }

    /// Use one reference ground track for every row
    pub fn with_rgt(mut self, rgt: i32) -> Self {
        self.rgt = Some(rgt);
        self
    }

    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows.max(1);
        self
    }
}

/// Small linear congruential generator; reproducible across platforms
struct Lcg(u64);

impl Lcg {
    fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn pick<T: Copy>(&mut self, items: &[T]) -> T {
        items[(self.next_u64() >> 33) as usize % items.len()]
    }
}

pub fn synthetic_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("time_ns", DataType::Timestamp(TimeUnit::Nanosecond, None), false),
        Field::new("latitude", DataType::Float64, false),
        Field::new("longitude", DataType::Float64, false),
        Field::new("height", DataType::Float64, true),
        Field::new("rgt", DataType::Int32, false),
        Field::new("cycle", DataType::Int16, false),
        Field::new("track", DataType::UInt8, false),
        Field::new("gt", DataType::Int16, false),
        Field::new("spot", DataType::UInt8, false),
        Field::new("pair", DataType::UInt8, false),
        Field::new("sc_orient", DataType::Int8, false),
        Field::new("atl03_cnf", DataType::Int8, false),
        Field::new("atl08_class", DataType::UInt8, false),
        Field::new("atl24_class", DataType::UInt8, false),
        Field::new("srcid", DataType::Int32, false),
    ]))
}

/// Generate the batches described by `spec`
pub fn synthetic_batches(spec: &SyntheticSpec) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let schema = synthetic_schema();
    let mut rng = Lcg(spec.seed ^ 0x9E37_79B9_7F4A_7C15);
    let sc_orient = (spec.seed % 2) as i8;
    let rgt = spec.rgt.unwrap_or(100 + (spec.seed % 1_300) as i32);
    let base_lat = -60.0 + (spec.seed % 120) as f64;
    let base_lon = -170.0 + (spec.seed % 340) as f64;
    let base_time: i64 = 1_577_836_800_000_000_000 + spec.seed as i64 * 1_000_000_000;

    let mut batches = Vec::new();
    let mut start = 0;
    while start < spec.rows {
        let len = spec.batch_rows.min(spec.rows - start);
        let mut time = Vec::with_capacity(len);
        let mut lat = Vec::with_capacity(len);
        let mut lon = Vec::with_capacity(len);
        let mut height = Vec::with_capacity(len);
        let mut track = Vec::with_capacity(len);
        let mut gt = Vec::with_capacity(len);
        let mut spot = Vec::with_capacity(len);
        let mut pair = Vec::with_capacity(len);
        let mut cnf = Vec::with_capacity(len);
        let mut class08 = Vec::with_capacity(len);
        let mut class24 = Vec::with_capacity(len);
        let mut srcid = Vec::with_capacity(len);

        for i in start..start + len {
            let t = (i % 3) as i64 + 1;
            let p = ((i / 3) % 2) as i64;
            time.push(base_time + i as i64 * 1_000_000);
            lat.push(base_lat + i as f64 * 1e-4);
            lon.push(base_lon + (t as f64) * 0.01 + rng.next_f64() * 1e-3);
            // a few missing heights, like real returns
            height.push(if i % 97 == 96 {
                None
            } else {
                Some(100.0 + (i as f64 * 0.01).sin() * 25.0 + rng.next_f64() * 5.0)
            });
            track.push(t as u8);
            pair.push(p as u8);
            gt.push(
                ground_track(sc_orient as i64, t, p)
                    .map(|b| b.code() as i16)
                    .unwrap_or(-1),
            );
            spot.push(spot_number(sc_orient as i64, t, p).unwrap_or(0) as u8);
            cnf.push(rng.pick(&ATL03_CNF_CODES));
            class08.push(rng.pick(&ATL08_CLASS_CODES));
            class24.push(rng.pick(&ATL24_CLASS_CODES));
            srcid.push((i % GRANULES.len()) as i32);
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(TimestampNanosecondArray::from(time)),
            Arc::new(Float64Array::from(lat)),
            Arc::new(Float64Array::from(lon)),
            Arc::new(Float64Array::from(height)),
            Arc::new(Int32Array::from(vec![rgt; len])),
            Arc::new(Int16Array::from(vec![spec.cycle; len])),
            Arc::new(UInt8Array::from(track)),
            Arc::new(Int16Array::from(gt)),
            Arc::new(UInt8Array::from(spot)),
            Arc::new(UInt8Array::from(pair)),
            Arc::new(Int8Array::from(vec![sc_orient; len])),
            Arc::new(Int8Array::from(cnf)),
            Arc::new(UInt8Array::from(class08)),
            Arc::new(UInt8Array::from(class24)),
            Arc::new(Int32Array::from(srcid)),
        ];
        batches.push(RecordBatch::try_new(schema.clone(), columns)?);
        start += len;
    }

    Ok((schema, batches))
}

/// Metadata attached to generated dataset files
pub fn synthetic_metadata() -> HashMap<String, String> {
    let srctbl: HashMap<String, &str> = GRANULES
        .iter()
        .enumerate()
        .map(|(i, g)| (i.to_string(), *g))
        .collect();
    let mut metadata = HashMap::new();
    metadata.insert(
        SRCTBL_KEY.to_string(),
        serde_json::to_string(&srctbl).unwrap_or_else(|_| "{}".to_string()),
    );
    metadata.insert(
        RECORDINFO_KEY.to_string(),
        r#"{"x":"longitude","y":"latitude","z":"height","time":"time_ns"}"#.to_string(),
    );
    metadata
}

/// A complete dataset file payload
pub fn synthetic_payload(spec: &SyntheticSpec) -> Result<Vec<u8>> {
    let (schema, batches) = synthetic_batches(spec)?;
    encode_dataset(&schema, &batches, synthetic_metadata())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::inspect_bytes;

    #[test]
    fn test_generation_is_deterministic() {
        let spec = SyntheticSpec::new(1_000, 5).with_batch_rows(300);
        let (_, a) = synthetic_batches(&spec).unwrap();
        let (_, b) = synthetic_batches(&spec).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.iter().map(|b| b.num_rows()).collect::<Vec<_>>(), vec![300, 300, 300, 100]);
    }

    #[test]
    fn test_payload_carries_metadata() {
        let bytes = synthetic_payload(&SyntheticSpec::new(500, 1)).unwrap();
        let info = inspect_bytes("p.arrow", &bytes).unwrap();
        assert_eq!(info.row_count, 500);
        assert_eq!(info.source_table().unwrap().unwrap().len(), 2);
        assert_eq!(info.record_info().unwrap().unwrap().x, "longitude");
    }

    #[test]
    fn test_empty_spec() {
        let (schema, batches) = synthetic_batches(&SyntheticSpec::new(0, 1)).unwrap();
        assert!(batches.is_empty());
        assert_eq!(schema.fields().len(), 15);
    }
}
