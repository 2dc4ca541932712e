//! CSV export of dataset rows

use std::collections::HashMap;
use std::io::Write;

use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use csv::WriterBuilder;
use ps_core::Value;
use tracing::debug;

use crate::engine::RowBatches;
use crate::schema::{cell_json, format_cell, value_at};
use crate::Result;

const SOURCE_ID_COLUMN: &str = "srcid";
const GRANULE_COLUMN: &str = "granule";

/// Writes record batches as CSV. The header comes from the first batch.
///
/// When a source table is given, the `srcid` column is written as
/// `granule` with ids replaced by granule names.
pub struct CsvExporter<W: Write> {
    writer: csv::Writer<W>,
    source_table: Option<HashMap<i64, String>>,
    header_written: bool,
    rows: u64,
}

impl<W: Write> CsvExporter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: WriterBuilder::new().from_writer(sink),
            source_table: None,
            header_written: false,
            rows: 0,
        }
    }

    pub fn with_source_table(mut self, table: Option<HashMap<i64, String>>) -> Self {
        self.source_table = table;
        self
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    fn maps_source(&self, name: &str) -> bool {
        self.source_table.is_some() && name == SOURCE_ID_COLUMN
    }

    pub fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let schema = batch.schema();
        if !self.header_written {
            let header: Vec<&str> = schema
                .fields()
                .iter()
                .map(|f| {
                    if self.maps_source(f.name()) {
                        GRANULE_COLUMN
                    } else {
                        f.name().as_str()
                    }
                })
                .collect();
            self.writer.write_record(&header)?;
            self.header_written = true;
        }

        let mapped: Vec<bool> = schema.fields().iter().map(|f| self.maps_source(f.name())).collect();
        let mut record = Vec::with_capacity(batch.num_columns());
        for row in 0..batch.num_rows() {
            record.clear();
            for (col, array) in batch.columns().iter().enumerate() {
                record.push(self.cell(array.as_ref(), row, mapped[col]));
            }
            self.writer.write_record(&record)?;
        }
        self.rows += batch.num_rows() as u64;
        Ok(())
    }

    fn cell(&self, array: &dyn Array, row: usize, map_source: bool) -> String {
        if map_source {
            if let (Some(table), Value::Int(id)) = (&self.source_table, value_at(array, row))
            {
                if let Some(granule) = table.get(&id) {
                    return granule.clone();
                }
            }
        }
        match cell_json(array, row) {
            serde_json::Value::Array(items) => serde_json::Value::Array(items).to_string(),
            _ => format_cell(array, row).unwrap_or_default(),
        }
    }

    /// Flush and hand back the sink
    pub fn finish(self) -> Result<W> {
        debug!("CSV export wrote {} rows", self.rows);
        self.writer
            .into_inner()
            .map_err(|e| crate::DataError::Io(e.into_error()))
    }

    /// Export every batch of a materialized result
    pub fn export_batches(mut self, batches: &[RecordBatch]) -> Result<W> {
        for batch in batches {
            self.write_batch(batch)?;
        }
        self.finish()
    }

    /// Export a streaming result, reading it to the end
    pub async fn export_rows(mut self, mut rows: RowBatches) -> Result<W> {
        while let Some(batch) = rows.next_batch().await {
            self.write_batch(&batch?)?;
        }
        rows.finish().await?;
        self.finish()
    }
}
