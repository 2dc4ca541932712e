//! Dataset files: Arrow IPC files with embedded key/value metadata

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;
use std::sync::Arc;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::{DataError, Result};

/// Metadata key holding the source table (`srcid` -> granule name, JSON)
pub const SRCTBL_KEY: &str = "srctbl";
/// Metadata key holding the x/y/z column names (JSON)
pub const RECORDINFO_KEY: &str = "recordinfo";

/// Which columns carry the coordinates of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInfo {
    pub x: String,
    pub y: String,
    #[serde(default)]
    pub z: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

/// Schema and size of a stored dataset
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub schema: SchemaRef,
    pub row_count: u64,
    pub num_batches: usize,
}

impl DatasetInfo {
    pub fn metadata(&self) -> &HashMap<String, String> {
        self.schema.metadata()
    }

    /// Source id to granule name lookup, if the dataset carries one
    pub fn source_table(&self) -> Result<Option<HashMap<i64, String>>> {
        source_table(&self.schema)
    }

    pub fn record_info(&self) -> Result<Option<RecordInfo>> {
        self.metadata()
            .get(RECORDINFO_KEY)
            .map(|raw| serde_json::from_str(raw).map_err(DataError::from))
            .transpose()
    }
}

/// Source id to granule name lookup stored in schema metadata
pub fn source_table(schema: &Schema) -> Result<Option<HashMap<i64, String>>> {
    let Some(raw) = schema.metadata().get(SRCTBL_KEY) else {
        return Ok(None);
    };
    let parsed: HashMap<String, String> = serde_json::from_str(raw)?;
    let mut table = HashMap::with_capacity(parsed.len());
    for (key, granule) in parsed {
        let id = key
            .parse::<i64>()
            .map_err(|_| DataError::Other(format!("Bad source id '{}' in {}", key, SRCTBL_KEY)))?;
        table.insert(id, granule);
    }
    Ok(Some(table))
}

/// Serialize batches into an Arrow IPC file payload.
/// `metadata` is merged into the schema metadata.
pub fn encode_dataset(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    metadata: HashMap<String, String>,
) -> Result<Vec<u8>> {
    let mut merged = schema.metadata().clone();
    merged.extend(metadata);
    let schema = Arc::new(schema.as_ref().clone().with_metadata(merged));

    let mut writer = FileWriter::try_new(Vec::new(), &schema)?;
    for batch in batches {
        let batch = batch.clone().with_schema(schema.clone())?;
        writer.write(&batch)?;
    }
    writer.finish()?;
    Ok(writer.into_inner()?)
}

fn open_reader<R: Read + Seek>(name: &str, reader: R) -> Result<FileReader<R>> {
    FileReader::try_new(reader, None).map_err(|e| corrupt(name, e))
}

fn corrupt(name: &str, e: impl std::fmt::Display) -> DataError {
    DataError::Corrupt {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

fn info_from<R: Read + Seek>(name: &str, reader: FileReader<R>) -> Result<DatasetInfo> {
    let schema = reader.schema();
    let mut row_count = 0u64;
    let mut num_batches = 0;
    for batch in reader {
        let batch = batch.map_err(|e| corrupt(name, e))?;
        row_count += batch.num_rows() as u64;
        num_batches += 1;
    }
    Ok(DatasetInfo {
        schema,
        row_count,
        num_batches,
    })
}

/// Validate a stored dataset and count its rows
pub fn inspect_file(name: &str, path: &Path) -> Result<DatasetInfo> {
    let file = File::open(path)?;
    info_from(name, open_reader(name, BufReader::new(file))?)
}

/// Validate an in-memory payload and count its rows
pub fn inspect_bytes(name: &str, bytes: &[u8]) -> Result<DatasetInfo> {
    info_from(name, open_reader(name, Cursor::new(bytes))?)
}

/// Read every batch of a stored dataset
pub fn read_file(name: &str, path: &Path) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let file = File::open(path)?;
    let reader = open_reader(name, BufReader::new(file))?;
    let schema = reader.schema();
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| corrupt(name, e))?;
    Ok((schema, batches))
}

/// Iterate the batches of a stored dataset without loading all of them
pub fn batch_reader(name: &str, path: &Path) -> Result<FileReader<BufReader<File>>> {
    let file = File::open(path)?;
    open_reader(name, BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int32Array};
    use arrow::datatypes::{DataType, Field};

    fn sample() -> (SchemaRef, Vec<RecordBatch>) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("srcid", DataType::Int32, false),
            Field::new("height", DataType::Float64, true),
        ]));
        let batches = (0..3)
            .map(|b| {
                RecordBatch::try_new(
                    schema.clone(),
                    vec![
                        Arc::new(Int32Array::from(vec![b; 4])),
                        Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0, 4.0])),
                    ],
                )
                .unwrap()
            })
            .collect();
        (schema, batches)
    }

    #[test]
    fn test_encode_and_inspect() {
        let (schema, batches) = sample();
        let mut metadata = HashMap::new();
        metadata.insert(SRCTBL_KEY.to_string(), r#"{"0": "ATL03_a.h5", "2": "ATL03_b.h5"}"#.to_string());
        metadata.insert(
            RECORDINFO_KEY.to_string(),
            r#"{"x": "longitude", "y": "latitude", "z": "height"}"#.to_string(),
        );

        let bytes = encode_dataset(&schema, &batches, metadata).unwrap();
        let info = inspect_bytes("t.arrow", &bytes).unwrap();
        assert_eq!(info.row_count, 12);
        assert_eq!(info.num_batches, 3);

        let table = info.source_table().unwrap().unwrap();
        assert_eq!(table.get(&2).map(String::as_str), Some("ATL03_b.h5"));
        assert_eq!(info.record_info().unwrap().unwrap().z.as_deref(), Some("height"));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = inspect_bytes("bad.arrow", b"definitely not arrow").unwrap_err();
        assert!(matches!(err, DataError::Corrupt { .. }));
    }

    #[test]
    fn test_read_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (schema, batches) = sample();
        let bytes = encode_dataset(&schema, &batches, HashMap::new()).unwrap();
        let path = dir.path().join("d.arrow");
        std::fs::write(&path, bytes).unwrap();

        let (read_schema, read_batches) = read_file("d.arrow", &path).unwrap();
        assert_eq!(read_schema.fields().len(), 2);
        assert_eq!(read_batches.len(), 3);
        assert_eq!(read_batches[1].column(0).len(), 4);
        assert!(source_table(&read_schema).unwrap().is_none());
    }
}
