//! Analytical query engine adapter
//!
//! Stored dataset files are loaded into tables of a session-scoped SQLite
//! catalog. Each query runs on the blocking pool with its own read-only
//! connection and streams Arrow batches back through a bounded channel.

mod batches;
mod helpers;
mod load;
pub mod sql;

pub use batches::{QueryHandle, QueryStats, RowBatches};
pub use helpers::ColumnSummary;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use arrow::record_batch::RecordBatch;
use parking_lot::{Mutex, RwLock};
use ps_core::{CancelToken, QueryIntent, SelectIntent};
use rusqlite::{Connection, OpenFlags, Row};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::schema::{arrow_schema, Column, ColumnBuilder, ColumnType};
use crate::{DataError, Result};

const CATALOG_FILE: &str = "catalog.db";

/// A dataset file made queryable as a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTable {
    pub file: String,
    pub table: String,
    pub columns: Vec<Column>,
    pub row_count: u64,
}

struct EngineInner {
    catalog: PathBuf,
    writer: Mutex<Connection>,
    tables: RwLock<AHashMap<String, RegisteredTable>>,
    blobs: BlobStore,
    batch_rows: usize,
}

/// Query engine bound to one blob store
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
}

impl QueryEngine {
    /// Start a fresh catalog in `dir`. Tables from a previous session are
    /// discarded; registration is per session.
    pub fn open(dir: impl AsRef<Path>, blobs: BlobStore, batch_rows: usize) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| DataError::EngineUnavailable(format!("{}: {}", dir.display(), e)))?;

        let catalog = dir.join(CATALOG_FILE);
        for suffix in ["", "-wal", "-shm"] {
            let stale = PathBuf::from(format!("{}{}", catalog.display(), suffix));
            if stale.exists() {
                std::fs::remove_file(&stale)
                    .map_err(|e| DataError::EngineUnavailable(format!("{}: {}", stale.display(), e)))?;
            }
        }

        let writer = Connection::open(&catalog)
            .map_err(|e| DataError::EngineUnavailable(e.to_string()))?;
        let mode: String = writer
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| DataError::EngineUnavailable(e.to_string()))?;
        writer
            .execute_batch("PRAGMA synchronous=OFF;")
            .map_err(|e| DataError::EngineUnavailable(e.to_string()))?;
        debug!(journal_mode = %mode, "Catalog opened");

        info!(catalog = %catalog.display(), batch_rows, "Query engine ready");
        Ok(Self {
            inner: Arc::new(EngineInner {
                catalog,
                writer: Mutex::new(writer),
                tables: RwLock::new(AHashMap::new()),
                blobs,
                batch_rows: batch_rows.max(1),
            }),
        })
    }

    /// Table name used for a dataset file
    pub fn table_name(file: &str) -> String {
        let stem = file.strip_suffix(".arrow").unwrap_or(file);
        stem.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect()
    }

    pub fn batch_rows(&self) -> usize {
        self.inner.batch_rows
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn is_registered(&self, file: &str) -> bool {
        self.inner.tables.read().contains_key(file)
    }

    pub fn registered(&self, file: &str) -> Option<RegisteredTable> {
        self.inner.tables.read().get(file).cloned()
    }

    pub fn tables(&self) -> Vec<RegisteredTable> {
        let mut tables: Vec<RegisteredTable> = self.inner.tables.read().values().cloned().collect();
        tables.sort_by(|a, b| a.file.cmp(&b.file));
        tables
    }

    /// Make a stored dataset file queryable. Registering an already
    /// registered file is a no-op.
    pub async fn register_file(&self, file: &str) -> Result<RegisteredTable> {
        if let Some(table) = self.registered(file) {
            return Ok(table);
        }
        if self.inner.blobs.is_writing(file) {
            return Err(DataError::NotYetAvailable(file.to_string()));
        }
        let handle = match self.inner.blobs.read(file).await {
            Ok(handle) => handle,
            Err(DataError::NotFound(_)) => return Err(DataError::TableNotFound(file.to_string())),
            Err(e) => return Err(e),
        };

        let inner = self.inner.clone();
        let file = file.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.writer.lock();
            if let Some(table) = inner.tables.read().get(&file) {
                return Ok(table.clone());
            }

            let table = Self::table_name(&file);
            let (columns, row_count) = load::load_table(&mut conn, &table, &file, &handle.path)?;
            let registered = RegisteredTable {
                file: file.clone(),
                table,
                columns,
                row_count,
            };
            inner.tables.write().insert(file.clone(), registered.clone());
            info!(file = %file, table = %registered.table, rows = row_count, "Registered dataset");
            Ok(registered)
        })
        .await?
    }

    /// Drop the table for a dataset file. Returns whether it was registered.
    pub async fn unregister_file(&self, file: &str) -> Result<bool> {
        let inner = self.inner.clone();
        let file = file.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = inner.writer.lock();
            let Some(table) = inner.tables.write().remove(&file) else {
                return Ok(false);
            };
            conn.execute(&format!("DROP TABLE IF EXISTS {}", sql::quote_ident(&table.table)), [])?;
            info!(file = %file, "Unregistered dataset");
            Ok(true)
        })
        .await?
    }

    /// Start executing `sql`
    pub async fn query(&self, sql: &str) -> Result<QueryHandle> {
        self.query_with_cancel(sql, CancelToken::new()).await
    }

    /// Start executing `sql`, stopping at the next batch boundary once
    /// `cancel` fires. Syntax and missing-table errors surface here; later
    /// failures arrive through the batch sequence.
    pub async fn query_with_cancel(&self, sql: &str, cancel: CancelToken) -> Result<QueryHandle> {
        let catalog = self.inner.catalog.clone();
        let batch_rows = self.inner.batch_rows;
        let sql = sql.to_string();
        let runtime = tokio::runtime::Handle::current();
        let (schema_tx, schema_rx) = oneshot::channel();
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let token = cancel.clone();

        debug!(sql = %sql, "Starting query");
        let producer = tokio::task::spawn_blocking(move || {
            let mut producer = Producer {
                schema_tx: Some(schema_tx),
                batch_tx,
                cancel: token,
                runtime,
            };
            producer.run(&catalog, &sql, batch_rows)
        });

        match schema_rx.await {
            Ok(Ok(columns)) => Ok(QueryHandle {
                columns,
                receiver: batch_rx,
                cancel,
                producer,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => match producer.await? {
                Err(e) => Err(e),
                Ok(_) => Err(DataError::Other("Query ended without a schema".to_string())),
            },
        }
    }

    /// Render an intent over the given dataset files and run it. Files are
    /// registered on demand; a file still being written fails fast.
    pub async fn query_intent(&self, files: &[String], intent: &QueryIntent) -> Result<QueryHandle> {
        self.query_intent_with_cancel(files, intent, CancelToken::new()).await
    }

    pub async fn query_intent_with_cancel(
        &self,
        files: &[String],
        intent: &QueryIntent,
        cancel: CancelToken,
    ) -> Result<QueryHandle> {
        let tables = self.ensure_registered(files).await?;
        self.check_columns(files, intent)?;
        let sql = match intent {
            QueryIntent::Select(select) if select.sample_percent.is_some() && select.projection.is_empty() => {
                // sampling adds a position column; name the real ones
                let select = SelectIntent {
                    projection: self.column_list(&files[0]),
                    ..select.clone()
                };
                sql::render_select(&tables, &select)
            }
            other => sql::render_intent(&tables, other),
        };
        self.query_with_cancel(&sql, cancel).await
    }

    fn column_list(&self, file: &str) -> Vec<String> {
        self.inner
            .tables
            .read()
            .get(file)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// SQLite reads an unknown double-quoted identifier as a string, so
    /// columns are checked against the registered tables first
    fn check_columns(&self, files: &[String], intent: &QueryIntent) -> Result<()> {
        let needed = sql::intent_columns(intent);
        let tables = self.inner.tables.read();
        for file in files {
            let Some(table) = tables.get(file) else {
                return Err(DataError::TableNotFound(file.clone()));
            };
            if let Some(missing) = needed
                .iter()
                .find(|name| !table.columns.iter().any(|c| c.name == **name))
            {
                return Err(DataError::QuerySyntax(format!(
                    "no such column: {} in {}",
                    missing, table.table
                )));
            }
        }
        Ok(())
    }

    /// Register each file and return the table names in order
    pub async fn ensure_registered(&self, files: &[String]) -> Result<Vec<String>> {
        if files.is_empty() {
            return Err(DataError::QuerySyntax("query needs at least one dataset".to_string()));
        }
        let mut tables = Vec::with_capacity(files.len());
        for file in files {
            if self.inner.blobs.is_writing(file) {
                return Err(DataError::NotYetAvailable(file.clone()));
            }
            tables.push(self.register_file(file).await?.table);
        }
        Ok(tables)
    }
}

fn open_reader(catalog: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        catalog,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| DataError::EngineUnavailable(e.to_string()))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| DataError::EngineUnavailable(e.to_string()))?;
    Ok(conn)
}

fn classify_prepare_error(e: rusqlite::Error) -> DataError {
    let msg = e.to_string();
    if msg.contains("no such table") {
        DataError::TableNotFound(msg)
    } else {
        DataError::QuerySyntax(msg)
    }
}

/// Accumulates rows into one Arrow batch
struct BatchBuilder {
    schema: arrow::datatypes::SchemaRef,
    builders: Vec<ColumnBuilder>,
    len: usize,
    capacity: usize,
}

impl BatchBuilder {
    fn new(columns: &[Column], capacity: usize) -> Self {
        Self {
            schema: arrow_schema(columns),
            builders: columns
                .iter()
                .map(|c| ColumnBuilder::new(c.column_type, capacity))
                .collect(),
            len: 0,
            capacity,
        }
    }

    fn append(&mut self, row: &Row<'_>) -> Result<()> {
        for (i, builder) in self.builders.iter_mut().enumerate() {
            builder.append(row.get_ref(i)?);
        }
        self.len += 1;
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    fn finish(&mut self) -> Result<RecordBatch> {
        let arrays = self.builders.iter_mut().map(ColumnBuilder::finish).collect();
        self.len = 0;
        Ok(RecordBatch::try_new(self.schema.clone(), arrays)?)
    }
}

/// Blocking side of a query
struct Producer {
    schema_tx: Option<oneshot::Sender<Result<Vec<Column>>>>,
    batch_tx: mpsc::Sender<Result<RecordBatch>>,
    cancel: CancelToken,
    runtime: tokio::runtime::Handle,
}

impl Producer {
    fn run(&mut self, catalog: &Path, sql: &str, batch_rows: usize) -> Result<QueryStats> {
        match self.produce(catalog, sql, batch_rows) {
            Ok(stats) => {
                debug!(rows = stats.rows, batches = stats.batches, "Query finished");
                Ok(stats)
            }
            Err(DataError::Cancelled) => {
                debug!("Query stopped");
                Err(DataError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                match self.schema_tx.take() {
                    Some(schema_tx) => {
                        let _ = schema_tx.send(Err(e));
                    }
                    None => {
                        warn!(error = %message, "Query failed while streaming");
                        self.send(Err(e));
                    }
                }
                Err(DataError::Other(message))
            }
        }
    }

    fn produce(&mut self, catalog: &Path, sql: &str, batch_rows: usize) -> Result<QueryStats> {
        let conn = open_reader(catalog)?;
        let mut stmt = conn.prepare(sql).map_err(classify_prepare_error)?;
        let declared: Vec<(String, Option<ColumnType>)> = stmt
            .columns()
            .iter()
            .map(|c| {
                (
                    c.name().to_string(),
                    c.decl_type().and_then(ColumnType::from_decltype),
                )
            })
            .collect();

        let mut rows = stmt.query([]).map_err(classify_prepare_error)?;
        let first = rows.next()?;

        // expression columns carry no declared type; take it from the first row
        let columns: Vec<Column> = declared
            .into_iter()
            .enumerate()
            .map(|(i, (name, decl))| {
                let column_type = decl.unwrap_or_else(|| {
                    first
                        .and_then(|row| row.get_ref(i).ok())
                        .map(ColumnType::infer)
                        .unwrap_or(ColumnType::Text)
                });
                Column::new(name, column_type)
            })
            .collect();

        let mut batch = BatchBuilder::new(&columns, batch_rows);
        if let Some(row) = first {
            batch.append(row)?;
        }

        match self.schema_tx.take() {
            Some(schema_tx) => {
                if schema_tx.send(Ok(columns)).is_err() {
                    return Err(DataError::Cancelled);
                }
            }
            None => return Err(DataError::Other("schema already sent".to_string())),
        }

        let mut stats = QueryStats::default();
        loop {
            if batch.is_full() {
                self.emit(&mut batch, &mut stats)?;
            }
            if self.cancel.is_cancelled() {
                return Err(DataError::Cancelled);
            }
            match rows.next()? {
                Some(row) => batch.append(row)?,
                None => break,
            }
        }
        if batch.len > 0 {
            self.emit(&mut batch, &mut stats)?;
        }
        Ok(stats)
    }

    fn emit(&mut self, batch: &mut BatchBuilder, stats: &mut QueryStats) -> Result<()> {
        let rows = batch.len as u64;
        let record_batch = batch.finish()?;
        if !self.send(Ok(record_batch)) {
            return Err(DataError::Cancelled);
        }
        stats.rows += rows;
        stats.batches += 1;
        Ok(())
    }

    /// Hand one item to the consumer, waiting for buffer space. Returns
    /// false when the consumer is gone or the query was cancelled.
    fn send(&self, item: Result<RecordBatch>) -> bool {
        let tx = &self.batch_tx;
        let cancel = &self.cancel;
        self.runtime.block_on(async move {
            tokio::select! {
                sent = tx.send(item) => sent.is_ok(),
                _ = cancel.cancelled() => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::encode_dataset;
    use crate::synthetic::{synthetic_batches, SyntheticSpec};
    use arrow::array::{Array, Int64Array};
    use ps_core::{Predicate, SelectIntent};
    use std::collections::HashMap;

    async fn setup(dir: &Path, batch_rows: usize) -> QueryEngine {
        let blobs = BlobStore::open_dir(dir.join("datasets"), 1 << 30, 64 * 1024)
            .await
            .unwrap();
        QueryEngine::open(dir.join(".engine"), blobs, batch_rows).unwrap()
    }

    async fn store(engine: &QueryEngine, file: &str, spec: SyntheticSpec) {
        let (schema, batches) = synthetic_batches(&spec).unwrap();
        let bytes = encode_dataset(&schema, &batches, HashMap::new()).unwrap();
        engine
            .blobs()
            .write_bytes(file, &bytes, &CancelToken::new())
            .await
            .unwrap();
    }

    #[test]
    fn test_table_name() {
        assert_eq!(QueryEngine::table_name("atl06_12.arrow"), "atl06_12");
        assert_eq!(QueryEngine::table_name("atl03x-phoreal_3.arrow"), "atl03x_phoreal_3");
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        store(&engine, "atl06_1.arrow", SyntheticSpec::new(250, 7)).await;

        let first = engine.register_file("atl06_1.arrow").await.unwrap();
        let second = engine.register_file("atl06_1.arrow").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.row_count, 250);
        assert_eq!(engine.tables().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_table_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        assert!(matches!(
            engine.register_file("nope.arrow").await,
            Err(DataError::TableNotFound(_))
        ));
        assert!(matches!(
            engine.query("SELECT * FROM nope").await,
            Err(DataError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_syntax_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        assert!(matches!(
            engine.query("SELEC 1").await,
            Err(DataError::QuerySyntax(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        store(&engine, "atl06_1.arrow", SyntheticSpec::new(20, 7)).await;

        let files = vec!["atl06_1.arrow".to_string()];
        let intent = QueryIntent::select(Predicate::eq("no_such_column", 1i64));
        assert!(matches!(
            engine.query_intent(&files, &intent).await,
            Err(DataError::QuerySyntax(_))
        ));
    }

    #[tokio::test]
    async fn test_rows_arrive_in_bounded_batches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        store(&engine, "atl06_1.arrow", SyntheticSpec::new(250, 7)).await;
        engine.register_file("atl06_1.arrow").await.unwrap();

        let handle = engine
            .query("SELECT rgt, height FROM atl06_1 ORDER BY rowid")
            .await
            .unwrap();
        assert_eq!(
            handle.schema(),
            &[
                Column::new("rgt", ColumnType::Integer),
                Column::new("height", ColumnType::Real)
            ]
        );

        let mut rows = handle.read_rows();
        let mut sizes = Vec::new();
        while let Some(batch) = rows.next_batch().await {
            sizes.push(batch.unwrap().num_rows());
        }
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(rows.finish().await.unwrap().rows, 250);
    }

    #[tokio::test]
    async fn test_no_matches_yields_no_batches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        store(&engine, "atl06_1.arrow", SyntheticSpec::new(50, 7)).await;

        let intent = QueryIntent::Select(SelectIntent::new(Predicate::eq("rgt", 42)));
        let batches = engine
            .query_intent(&["atl06_1.arrow".to_string()], &intent)
            .await
            .unwrap()
            .read_rows()
            .collect()
            .await
            .unwrap();
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_expression_columns_are_typed_from_values() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        let handle = engine.query("SELECT 1 + 1 AS two, 'x' AS label").await.unwrap();
        assert_eq!(handle.schema()[0].column_type, ColumnType::Integer);
        assert_eq!(handle.schema()[1].column_type, ColumnType::Text);
        let batches = handle.read_rows().collect().await.unwrap();
        let two = batches[0].column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(two.value(0), 2);
    }

    #[tokio::test]
    async fn test_dropping_rows_stops_producer() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 10).await;
        store(&engine, "atl06_1.arrow", SyntheticSpec::new(1_000, 7)).await;
        engine.register_file("atl06_1.arrow").await.unwrap();

        let handle = engine.query("SELECT * FROM atl06_1").await.unwrap();
        let token = handle.cancel_token();
        let mut rows = handle.read_rows();
        assert!(rows.next_batch().await.unwrap().is_ok());
        drop(rows);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_ends_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 10).await;
        store(&engine, "atl06_1.arrow", SyntheticSpec::new(1_000, 7)).await;
        engine.register_file("atl06_1.arrow").await.unwrap();

        let mut rows = engine
            .query("SELECT * FROM atl06_1")
            .await
            .unwrap()
            .read_rows();
        assert!(rows.next_batch().await.is_some());
        rows.cancel();
        let mut after_cancel = 0;
        while rows.next_batch().await.is_some() {
            after_cancel += 1;
        }
        // at most the one batch already buffered
        assert!(after_cancel <= 1);
        assert!(matches!(rows.finish().await, Err(DataError::Cancelled)));
    }

    #[tokio::test]
    async fn test_query_spans_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 1000).await;
        store(&engine, "atl06_1.arrow", SyntheticSpec::new(30, 1).with_rgt(11)).await;
        store(&engine, "atl06_2.arrow", SyntheticSpec::new(20, 2).with_rgt(22)).await;

        let files = vec!["atl06_1.arrow".to_string(), "atl06_2.arrow".to_string()];
        let batches = engine
            .query_intent(&files, &QueryIntent::distinct("rgt"))
            .await
            .unwrap()
            .read_rows()
            .collect()
            .await
            .unwrap();
        let rgts = batches[0].column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(rgts.len(), 2);
        assert_eq!((rgts.value(0), rgts.value(1)), (11, 22));
    }

    #[tokio::test]
    async fn test_unregister_drops_table() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        store(&engine, "atl06_1.arrow", SyntheticSpec::new(10, 1)).await;
        engine.register_file("atl06_1.arrow").await.unwrap();

        assert!(engine.unregister_file("atl06_1.arrow").await.unwrap());
        assert!(!engine.unregister_file("atl06_1.arrow").await.unwrap());
        assert!(matches!(
            engine.query("SELECT * FROM atl06_1").await,
            Err(DataError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(dir.path(), 100).await;
        engine
            .blobs()
            .write_bytes("bad.arrow", b"not arrow at all", &CancelToken::new())
            .await
            .unwrap();
        assert!(matches!(
            engine.register_file("bad.arrow").await,
            Err(DataError::Corrupt { .. })
        ));
        assert!(!engine.is_registered("bad.arrow"));
    }
}
