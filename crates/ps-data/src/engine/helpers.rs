//! Convenience queries built on [`QueryEngine::query`]

use arrow::record_batch::RecordBatch;
use ps_core::fields::FieldNames;
use ps_core::request::RequestSummary;
use ps_core::{CancelToken, Predicate, QueryIntent, SelectIntent, Value};

use super::sql::{quote_ident, render_distinct, render_predicate};
use super::{QueryEngine, QueryHandle};
use crate::schema::value_at;
use crate::{DataError, Result};

/// Range and spread of one numeric column
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSummary {
    /// Non-null values that passed the predicate
    pub count: u64,
    pub min: f64,
    pub max: f64,
    /// 10th percentile
    pub low: f64,
    /// 90th percentile
    pub high: f64,
}

fn first_cell(batches: &[RecordBatch], column: usize) -> Value {
    batches
        .iter()
        .find(|b| b.num_rows() > 0)
        .map(|b| value_at(b.column(column).as_ref(), 0))
        .unwrap_or(Value::Null)
}

impl QueryEngine {
    async fn collect_sql(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        self.query(sql).await?.read_rows().collect().await
    }

    /// Row count of an arbitrary query
    pub async fn count_rows(&self, sql: &str) -> Result<u64> {
        let batches = self
            .collect_sql(&format!("SELECT COUNT(*) AS count FROM ({})", sql))
            .await?;
        Ok(first_cell(&batches, 0).as_i64().unwrap_or(0).max(0) as u64)
    }

    /// Column names of a dataset file, registering it if needed
    pub async fn column_names(&self, file: &str) -> Result<Vec<String>> {
        let table = self.register_file(file).await?;
        Ok(table.columns.into_iter().map(|c| c.name).collect())
    }

    /// Sorted distinct non-null values of `column` across the files
    pub async fn distinct_values(
        &self,
        files: &[String],
        column: &str,
        predicate: &Predicate,
    ) -> Result<Vec<Value>> {
        let tables = self.ensure_registered(files).await?;
        let batches = self
            .collect_sql(&render_distinct(&tables, column, predicate))
            .await?;
        let mut values = Vec::new();
        for batch in &batches {
            let array = batch.column(0);
            for row in 0..batch.num_rows() {
                values.push(value_at(array.as_ref(), row));
            }
        }
        Ok(values)
    }

    /// Value at a fraction (0..=1) of the sorted non-null column
    pub async fn percentile(
        &self,
        files: &[String],
        column: &str,
        predicate: &Predicate,
        fraction: f64,
    ) -> Result<Option<f64>> {
        let source = self.filtered_source(files, column, predicate).await?;
        let count = self.count_rows(&source).await?;
        if count == 0 {
            return Ok(None);
        }
        let offset = ((count - 1) as f64 * fraction.clamp(0.0, 1.0)).floor() as u64;
        let sql = format!(
            "SELECT {col} FROM ({source}) ORDER BY {col} LIMIT 1 OFFSET {offset}",
            col = quote_ident(column),
            source = source,
            offset = offset
        );
        Ok(first_cell(&self.collect_sql(&sql).await?, 0).as_f64())
    }

    /// Min, max and 10th/90th percentiles of a numeric column. Nulls are
    /// left out of every figure, the count included.
    pub async fn column_summary(
        &self,
        files: &[String],
        column: &str,
        predicate: &Predicate,
    ) -> Result<Option<ColumnSummary>> {
        let source = self.filtered_source(files, column, predicate).await?;
        let col = quote_ident(column);
        let sql = format!(
            "SELECT COUNT(*) AS count, MIN({col}) AS min, MAX({col}) AS max FROM ({source})",
            col = col,
            source = source
        );
        let batches = self.collect_sql(&sql).await?;
        let count = first_cell(&batches, 0).as_i64().unwrap_or(0);
        if count == 0 {
            return Ok(None);
        }
        let (Some(min), Some(max)) = (first_cell(&batches, 1).as_f64(), first_cell(&batches, 2).as_f64()) else {
            return Ok(None);
        };

        let low = self.percentile(files, column, predicate, 0.10).await?.unwrap_or(min);
        let high = self.percentile(files, column, predicate, 0.90).await?.unwrap_or(max);
        Ok(Some(ColumnSummary {
            count: count as u64,
            min,
            max,
            low,
            high,
        }))
    }

    /// Union of one column across the files, filtered and without nulls
    async fn filtered_source(&self, files: &[String], column: &str, predicate: &Predicate) -> Result<String> {
        let tables = self.ensure_registered(files).await?;
        let filter = render_predicate(&Predicate::and([
            predicate.clone(),
            Predicate::not_null(column),
        ]));
        let parts: Vec<String> = tables
            .iter()
            .map(|t| {
                format!(
                    "SELECT {} FROM {} WHERE {}",
                    quote_ident(column),
                    quote_ident(t),
                    filter
                )
            })
            .collect();
        Ok(parts.join(" UNION ALL "))
    }

    /// Geographic and height extent of one dataset file. `None` when the
    /// file lacks the coordinate columns or has no rows.
    pub async fn dataset_summary(&self, file: &str, fields: &FieldNames) -> Result<Option<RequestSummary>> {
        let names = self.column_names(file).await?;
        let has = |c: &str| names.iter().any(|n| n == c);
        if !has(&fields.lat) || !has(&fields.lon) || !has(&fields.height) {
            return Ok(None);
        }

        let files = [file.to_string()];
        let all = Predicate::True;
        let Some(lat) = self.column_summary(&files, &fields.lat, &all).await? else {
            return Ok(None);
        };
        let Some(lon) = self.column_summary(&files, &fields.lon, &all).await? else {
            return Ok(None);
        };
        let Some(height) = self.column_summary(&files, &fields.height, &all).await? else {
            return Ok(None);
        };
        let low_height = self
            .percentile(&files, &fields.height, &all, 0.05)
            .await?
            .unwrap_or(height.min);
        let high_height = self
            .percentile(&files, &fields.height, &all, 0.95)
            .await?
            .unwrap_or(height.max);

        Ok(Some(RequestSummary {
            min_lat: lat.min,
            max_lat: lat.max,
            min_lon: lon.min,
            max_lon: lon.max,
            min_height: height.min,
            max_height: height.max,
            low_height,
            high_height,
        }))
    }

    /// Select at most `max_points` rows, thinning evenly when the filtered
    /// selection is larger
    pub async fn sampled_select(
        &self,
        files: &[String],
        select: SelectIntent,
        max_points: usize,
        cancel: CancelToken,
    ) -> Result<QueryHandle> {
        if max_points == 0 {
            return Err(DataError::QuerySyntax("max_points must be positive".to_string()));
        }
        let tables = self.ensure_registered(files).await?;
        let unsampled = SelectIntent {
            order_by: Vec::new(),
            limit: None,
            sample_percent: None,
            ..select.clone()
        };
        let total = self
            .count_rows(&super::sql::render_select(&tables, &unsampled))
            .await?;

        let mut select = select;
        if total > max_points as u64 {
            select.sample_percent = Some(max_points as f64 / total as f64 * 100.0);
        }
        let limit = select.limit.map_or(max_points, |l| l.min(max_points));
        select.limit = Some(limit);
        self.query_intent_with_cancel(files, &QueryIntent::Select(select), cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;
    use crate::dataset::encode_dataset;
    use crate::synthetic::{synthetic_batches, SyntheticSpec};
    use std::collections::HashMap;
    use std::path::Path;

    async fn engine_with(dir: &Path, files: &[(&str, SyntheticSpec)]) -> QueryEngine {
        let blobs = BlobStore::open_dir(dir.join("datasets"), 1 << 30, 64 * 1024)
            .await
            .unwrap();
        let engine = QueryEngine::open(dir.join(".engine"), blobs, 500).unwrap();
        for (name, spec) in files {
            let (schema, batches) = synthetic_batches(spec).unwrap();
            let bytes = encode_dataset(&schema, &batches, HashMap::new()).unwrap();
            engine
                .blobs()
                .write_bytes(name, &bytes, &CancelToken::new())
                .await
                .unwrap();
        }
        engine
    }

    #[tokio::test]
    async fn test_count_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), &[("a.arrow", SyntheticSpec::new(321, 1))]).await;
        let names = engine.column_names("a.arrow").await.unwrap();
        assert!(names.contains(&"height".to_string()));
        assert_eq!(engine.count_rows("SELECT * FROM a").await.unwrap(), 321);
        assert_eq!(
            engine.count_rows("SELECT * FROM a WHERE rgt = -1").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_distinct_values() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), &[("a.arrow", SyntheticSpec::new(200, 1))]).await;
        let files = vec!["a.arrow".to_string()];
        let cycles = engine
            .distinct_values(&files, "track", &Predicate::True)
            .await
            .unwrap();
        assert_eq!(cycles, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[tokio::test]
    async fn test_column_summary_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), &[("a.arrow", SyntheticSpec::new(1_000, 3))]).await;
        let files = vec!["a.arrow".to_string()];
        let summary = engine
            .column_summary(&files, "height", &Predicate::True)
            .await
            .unwrap()
            .unwrap();
        // every 97th height is null
        assert_eq!(summary.count, 990);
        assert!(summary.min <= summary.low);
        assert!(summary.low <= summary.high);
        assert!(summary.high <= summary.max);

        let none = engine
            .column_summary(&files, "height", &Predicate::eq("rgt", -5))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_dataset_summary() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), &[("a.arrow", SyntheticSpec::new(500, 3))]).await;
        let summary = engine
            .dataset_summary("a.arrow", &FieldNames::for_api("atl03x"))
            .await
            .unwrap()
            .unwrap();
        assert!(summary.min_lat <= summary.max_lat);
        assert!(summary.low_height >= summary.min_height);
        assert!(summary.high_height <= summary.max_height);

        // atl06 datasets use h_mean, which the synthetic data lacks
        assert!(engine
            .dataset_summary("a.arrow", &FieldNames::for_api("atl06"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_sampled_select_caps_points() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), &[("a.arrow", SyntheticSpec::new(2_000, 3))]).await;
        let files = vec!["a.arrow".to_string()];
        let select = SelectIntent::new(Predicate::True).project(["height"]);
        let batches = engine
            .sampled_select(&files, select, 300, CancelToken::new())
            .await
            .unwrap()
            .read_rows()
            .collect()
            .await
            .unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert!(rows > 0);
        assert!(rows <= 300);
    }

    #[tokio::test]
    async fn test_sampled_select_keeps_filtered_rows() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), &[("a.arrow", SyntheticSpec::new(3_000, 3))]).await;
        let files = vec!["a.arrow".to_string()];
        // track 1 sits on every third rowid
        let select = SelectIntent::new(Predicate::eq("track", 1)).project(["track", "height"]);
        let batches = engine
            .sampled_select(&files, select, 334, CancelToken::new())
            .await
            .unwrap()
            .read_rows()
            .collect()
            .await
            .unwrap();
        let tracks: Vec<Value> = batches
            .iter()
            .flat_map(|b| (0..b.num_rows()).map(move |row| value_at(b.column(0).as_ref(), row)))
            .collect();
        assert_eq!(tracks.len(), 334);
        assert!(tracks.iter().all(|t| *t == Value::Int(1)));
    }

    #[tokio::test]
    async fn test_sampled_select_without_projection() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            dir.path(),
            &[
                ("a.arrow", SyntheticSpec::new(500, 1)),
                ("b.arrow", SyntheticSpec::new(500, 2)),
            ],
        )
        .await;
        let files = vec!["a.arrow".to_string(), "b.arrow".to_string()];
        let handle = engine
            .sampled_select(&files, SelectIntent::new(Predicate::True), 100, CancelToken::new())
            .await
            .unwrap();
        let names: Vec<String> = handle.schema().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, engine.column_names("a.arrow").await.unwrap());

        let batches = handle.read_rows().collect().await.unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 100);
    }
}
