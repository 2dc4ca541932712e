//! Loading dataset files into engine tables

use std::path::Path;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, StringArray,
    TimestampNanosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use super::sql::quote_ident;
use crate::dataset::batch_reader;
use crate::schema::{format_cell, Column, ColumnType};
use crate::{DataError, Result};

/// One Arrow column converted to a SQLite-friendly representation
enum SqlColumn {
    Integer(Int64Array),
    Real(Float64Array),
    Boolean(BooleanArray),
    Text(StringArray),
    Timestamp(TimestampNanosecondArray),
    Blob(BinaryArray),
    Formatted(Vec<Option<String>>),
}

impl SqlColumn {
    fn convert(array: &ArrayRef, column_type: ColumnType) -> Result<SqlColumn> {
        let converted = match column_type {
            ColumnType::Integer => SqlColumn::Integer(downcast(cast(array, &DataType::Int64)?)?),
            ColumnType::Real => SqlColumn::Real(downcast(cast(array, &DataType::Float64)?)?),
            ColumnType::Boolean => SqlColumn::Boolean(downcast(cast(array, &DataType::Boolean)?)?),
            ColumnType::Timestamp => SqlColumn::Timestamp(downcast(cast(
                array,
                &DataType::Timestamp(TimeUnit::Nanosecond, None),
            )?)?),
            ColumnType::Blob => SqlColumn::Blob(downcast(cast(array, &DataType::Binary)?)?),
            ColumnType::Text => match array.data_type() {
                DataType::Utf8 | DataType::LargeUtf8 => {
                    SqlColumn::Text(downcast(cast(array, &DataType::Utf8)?)?)
                }
                _ => SqlColumn::Formatted(
                    (0..array.len())
                        .map(|i| format_cell(array.as_ref(), i))
                        .collect(),
                ),
            },
        };
        Ok(converted)
    }

    fn value(&self, row: usize) -> SqlValue {
        fn opt<A: Array>(a: &A, row: usize, f: impl FnOnce() -> SqlValue) -> SqlValue {
            if a.is_null(row) {
                SqlValue::Null
            } else {
                f()
            }
        }
        match self {
            SqlColumn::Integer(a) => opt(a, row, || SqlValue::Integer(a.value(row))),
            SqlColumn::Real(a) => opt(a, row, || SqlValue::Real(a.value(row))),
            SqlColumn::Boolean(a) => opt(a, row, || SqlValue::Integer(a.value(row) as i64)),
            SqlColumn::Text(a) => opt(a, row, || SqlValue::Text(a.value(row).to_string())),
            SqlColumn::Timestamp(a) => opt(a, row, || SqlValue::Integer(a.value(row))),
            SqlColumn::Blob(a) => opt(a, row, || SqlValue::Blob(a.value(row).to_vec())),
            SqlColumn::Formatted(values) => values[row]
                .clone()
                .map(SqlValue::Text)
                .unwrap_or(SqlValue::Null),
        }
    }
}

fn downcast<A: Array + Clone + 'static>(array: ArrayRef) -> Result<A> {
    array
        .as_any()
        .downcast_ref::<A>()
        .cloned()
        .ok_or_else(|| DataError::Other(format!("Unexpected array type {}", array.data_type())))
}

/// Load a dataset file into a fresh table, replacing any table of the same
/// name. Runs inside one transaction. Returns the table columns and row count.
pub(crate) fn load_table(
    conn: &mut Connection,
    table: &str,
    file_name: &str,
    path: &Path,
) -> Result<(Vec<Column>, u64)> {
    let reader = batch_reader(file_name, path)?;
    let schema = reader.schema();
    let columns: Vec<Column> = schema
        .fields()
        .iter()
        .map(|f| Column::new(f.name(), ColumnType::from_arrow(f.data_type())))
        .collect();

    let tx = conn.transaction()?;
    tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;

    let definitions: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.decltype()))
        .collect();
    tx.execute(
        &format!("CREATE TABLE {} ({})", quote_ident(table), definitions.join(", ")),
        [],
    )?;

    let mut rows = 0u64;
    if !columns.is_empty() {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} VALUES ({})",
            quote_ident(table),
            placeholders
        ))?;

        for batch in reader {
            let batch: RecordBatch = batch.map_err(|e| DataError::Corrupt {
                name: file_name.to_string(),
                reason: e.to_string(),
            })?;
            let converted = batch
                .columns()
                .iter()
                .zip(&columns)
                .map(|(array, column)| SqlColumn::convert(array, column.column_type))
                .collect::<Result<Vec<_>>>()?;

            for row in 0..batch.num_rows() {
                stmt.execute(params_from_iter(converted.iter().map(|c| c.value(row))))?;
            }
            rows += batch.num_rows() as u64;
            debug!(table, rows, "Loaded batch");
        }
    }

    tx.commit()?;
    Ok((columns, rows))
}
