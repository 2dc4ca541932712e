//! Column typing shared by the query engine and the exporters

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryBuilder, BooleanArray, BooleanBuilder, Float64Array, Float64Builder,
    Int64Array, Int64Builder, StringBuilder, TimestampNanosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use ps_core::Value;
use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};

/// Logical column type exposed in query schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Boolean,
    Text,
    Timestamp,
    Blob,
}

impl ColumnType {
    /// Declared type used when creating engine tables
    pub fn decltype(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Text => "TEXT",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Blob => "BLOB",
        }
    }

    /// Parse a declared column type. Unknown declarations yield `None`.
    pub fn from_decltype(decl: &str) -> Option<ColumnType> {
        let upper = decl.to_uppercase();
        match upper.as_str() {
            "INTEGER" | "INT" | "BIGINT" => Some(ColumnType::Integer),
            "REAL" | "FLOAT" | "DOUBLE" => Some(ColumnType::Real),
            "BOOLEAN" | "BOOL" => Some(ColumnType::Boolean),
            "TEXT" | "VARCHAR" => Some(ColumnType::Text),
            "TIMESTAMP" | "DATETIME" => Some(ColumnType::Timestamp),
            "BLOB" => Some(ColumnType::Blob),
            _ => None,
        }
    }

    /// Storage type for an Arrow column loaded into the engine
    pub fn from_arrow(data_type: &DataType) -> ColumnType {
        match data_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => ColumnType::Integer,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => ColumnType::Real,
            DataType::Boolean => ColumnType::Boolean,
            DataType::Timestamp(_, _) => ColumnType::Timestamp,
            DataType::Binary | DataType::LargeBinary => ColumnType::Blob,
            _ => ColumnType::Text,
        }
    }

    /// Type of an unannotated expression column, inferred from a sample value
    pub fn infer(value: ValueRef<'_>) -> ColumnType {
        match value {
            ValueRef::Integer(_) => ColumnType::Integer,
            ValueRef::Real(_) => ColumnType::Real,
            ValueRef::Blob(_) => ColumnType::Blob,
            ValueRef::Text(_) | ValueRef::Null => ColumnType::Text,
        }
    }

    pub fn arrow_type(&self) -> DataType {
        match self {
            ColumnType::Integer => DataType::Int64,
            ColumnType::Real => DataType::Float64,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Text => DataType::Utf8,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Nanosecond, None),
            ColumnType::Blob => DataType::Binary,
        }
    }
}

/// A named, typed result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Arrow schema for a list of result columns
pub fn arrow_schema(columns: &[Column]) -> SchemaRef {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.name, c.column_type.arrow_type(), true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Typed Arrow builder fed from SQLite row values
pub(crate) enum ColumnBuilder {
    Integer(Int64Builder),
    Real(Float64Builder),
    Boolean(BooleanBuilder),
    Text(StringBuilder),
    Timestamp(TimestampNanosecondBuilder),
    Blob(BinaryBuilder),
}

impl ColumnBuilder {
    pub(crate) fn new(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Integer => ColumnBuilder::Integer(Int64Builder::with_capacity(capacity)),
            ColumnType::Real => ColumnBuilder::Real(Float64Builder::with_capacity(capacity)),
            ColumnType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
            ColumnType::Text => ColumnBuilder::Text(StringBuilder::new()),
            ColumnType::Timestamp => {
                ColumnBuilder::Timestamp(TimestampNanosecondBuilder::with_capacity(capacity))
            }
            ColumnType::Blob => ColumnBuilder::Blob(BinaryBuilder::new()),
        }
    }

    /// Append one value, coercing where the storage class differs from the
    /// declared type and appending null where no coercion makes sense
    pub(crate) fn append(&mut self, value: ValueRef<'_>) {
        match self {
            ColumnBuilder::Integer(b) => match value {
                ValueRef::Integer(i) => b.append_value(i),
                ValueRef::Real(f) if f.fract() == 0.0 => b.append_value(f as i64),
                _ => b.append_null(),
            },
            ColumnBuilder::Real(b) => match value {
                ValueRef::Real(f) => b.append_value(f),
                ValueRef::Integer(i) => b.append_value(i as f64),
                ValueRef::Text(s) => match std::str::from_utf8(s).ok().and_then(|s| s.parse().ok()) {
                    Some(f) => b.append_value(f),
                    None => b.append_null(),
                },
                _ => b.append_null(),
            },
            ColumnBuilder::Boolean(b) => match value {
                ValueRef::Integer(i) => b.append_value(i != 0),
                _ => b.append_null(),
            },
            ColumnBuilder::Text(b) => match value {
                ValueRef::Text(s) => b.append_value(String::from_utf8_lossy(s)),
                ValueRef::Integer(i) => b.append_value(i.to_string()),
                ValueRef::Real(f) => b.append_value(f.to_string()),
                ValueRef::Blob(_) | ValueRef::Null => b.append_null(),
            },
            ColumnBuilder::Timestamp(b) => match value {
                ValueRef::Integer(i) => b.append_value(i),
                _ => b.append_null(),
            },
            ColumnBuilder::Blob(b) => match value {
                ValueRef::Blob(bytes) => b.append_value(bytes),
                _ => b.append_null(),
            },
        }
    }

    pub(crate) fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Integer(b) => Arc::new(b.finish()),
            ColumnBuilder::Real(b) => Arc::new(b.finish()),
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::Text(b) => Arc::new(b.finish()),
            ColumnBuilder::Timestamp(b) => Arc::new(b.finish()),
            ColumnBuilder::Blob(b) => Arc::new(b.finish()),
        }
    }
}

/// Read one cell as a [`Value`]. Types without a scalar mapping are
/// rendered as text.
pub fn value_at(array: &dyn Array, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    if let Some(a) = array.as_any().downcast_ref::<Int64Array>() {
        return Value::Int(a.value(row));
    }
    if let Some(a) = array.as_any().downcast_ref::<Float64Array>() {
        return Value::Float(a.value(row));
    }
    if let Some(a) = array.as_any().downcast_ref::<BooleanArray>() {
        return Value::Bool(a.value(row));
    }
    match array.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => numeric_cell(array, row, &DataType::Int64),
        DataType::Float16 | DataType::Float32 => numeric_cell(array, row, &DataType::Float64),
        _ => format_cell(array, row).map(Value::Text).unwrap_or(Value::Null),
    }
}

fn numeric_cell(array: &dyn Array, row: usize, target: &DataType) -> Value {
    let slice = array.slice(row, 1);
    match arrow::compute::cast(slice.as_ref(), target) {
        Ok(cast) => {
            if let Some(a) = cast.as_any().downcast_ref::<Int64Array>() {
                if a.is_valid(0) {
                    return Value::Int(a.value(0));
                }
            }
            if let Some(a) = cast.as_any().downcast_ref::<Float64Array>() {
                if a.is_valid(0) {
                    return Value::Float(a.value(0));
                }
            }
            Value::Null
        }
        Err(_) => Value::Null,
    }
}

/// Display string for one cell
pub fn format_cell(array: &dyn Array, row: usize) -> Option<String> {
    if array.is_null(row) {
        return None;
    }
    let options = FormatOptions::default();
    let formatter = ArrayFormatter::try_new(array, &options).ok()?;
    Some(formatter.value(row).to_string())
}

/// JSON rendering of one cell; list cells become JSON arrays
pub fn cell_json(array: &dyn Array, row: usize) -> serde_json::Value {
    if array.is_null(row) {
        return serde_json::Value::Null;
    }
    match array.data_type() {
        DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _) => {
            let items = list_values(array, row);
            match items {
                Some(items) => serde_json::Value::Array(
                    (0..items.len()).map(|i| cell_json(items.as_ref(), i)).collect(),
                ),
                None => serde_json::Value::Null,
            }
        }
        _ => match value_at(array, row) {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s),
        },
    }
}

fn list_values(array: &dyn Array, row: usize) -> Option<ArrayRef> {
    use arrow::array::{FixedSizeListArray, LargeListArray, ListArray};
    if let Some(list) = array.as_any().downcast_ref::<ListArray>() {
        return Some(list.value(row));
    }
    if let Some(list) = array.as_any().downcast_ref::<LargeListArray>() {
        return Some(list.value(row));
    }
    if let Some(list) = array.as_any().downcast_ref::<FixedSizeListArray>() {
        return Some(list.value(row));
    }
    None
}
