//! Request metadata store
//!
//! CRUD over request records with auto-assigned ids. Deleting a record does
//! not touch its dataset file; the caller owns that cascade.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use ps_core::request::RequestSummary;
use ps_core::{RequestId, RequestRecord, RequestStatus, RequestUpdate};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::db::Database;
use crate::{DataError, Result};

/// What changed in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestChange {
    Added(RequestId),
    Updated(RequestId),
    Deleted(RequestId),
    Cleared,
}

/// Trait for components that keep a live view of the request list
pub trait RequestSubscriber: Send + Sync {
    fn on_requests_changed(&self, change: &RequestChange);
}

/// Request records persisted in the metadata database
#[derive(Clone)]
pub struct RequestStore {
    db: Database,
    subscribers: Arc<RwLock<Vec<Weak<dyn RequestSubscriber>>>>,
}

const COLUMNS: &str = "id, api, parameters, status, star, start_time, end_time, status_details, \
                       file, row_count, num_bytes, description, summary";

impl RequestStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a pending record and return its id
    pub async fn add_pending(&self) -> Result<RequestId> {
        self.add_pending_with(None, serde_json::Value::Null).await
    }

    /// Create a pending record carrying the submitted API and parameters
    pub async fn add_pending_with(
        &self,
        api: Option<String>,
        parameters: serde_json::Value,
    ) -> Result<RequestId> {
        let parameters = serde_json::to_string(&parameters)?;
        let id = self
            .db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO requests (api, parameters, status) VALUES (?1, ?2, ?3)",
                    params![api, parameters, RequestStatus::Pending.as_str()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        info!(request_id = id, "Added pending request");
        self.notify_subscribers(RequestChange::Added(id));
        Ok(id)
    }

    /// Apply a partial update. Status must move forward and `end_time`
    /// may not precede `start_time`.
    pub async fn update(&self, id: RequestId, update: RequestUpdate) -> Result<RequestRecord> {
        let record = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut record = fetch(&tx, id)?.ok_or_else(|| not_found(id))?;

                if let Some(next) = update.status {
                    if !record.status.can_transition_to(next) {
                        return Err(DataError::InvalidTransition {
                            id,
                            from: record.status,
                            to: next,
                        });
                    }
                }

                record.apply(update);

                if let (Some(start), Some(end)) = (record.start_time, record.end_time) {
                    if end < start {
                        return Err(DataError::InvalidUpdate(format!(
                            "request {}: end_time {} precedes start_time {}",
                            id, end, start
                        )));
                    }
                }

                store(&tx, &record)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;

        debug!(request_id = id, status = %record.status, "Updated request");
        self.notify_subscribers(RequestChange::Updated(id));
        Ok(record)
    }

    /// Remove a record. Returns whether it existed.
    pub async fn delete(&self, id: RequestId) -> Result<bool> {
        let removed = self
            .db
            .call(move |conn| Ok(conn.execute("DELETE FROM requests WHERE id = ?1", [id])? > 0))
            .await?;

        if removed {
            info!(request_id = id, "Deleted request");
            self.notify_subscribers(RequestChange::Deleted(id));
        }
        Ok(removed)
    }

    /// Remove every record, returning how many were removed
    pub async fn delete_all(&self) -> Result<usize> {
        let count = self
            .db
            .call(|conn| Ok(conn.execute("DELETE FROM requests", [])?))
            .await?;
        info!(count, "Deleted all requests");
        self.notify_subscribers(RequestChange::Cleared);
        Ok(count)
    }

    pub async fn get(&self, id: RequestId) -> Result<RequestRecord> {
        self.db
            .call(move |conn| fetch(conn, id)?.ok_or_else(|| not_found(id)))
            .await
    }

    /// All records, newest first
    pub async fn list(&self) -> Result<Vec<RequestRecord>> {
        self.db
            .call(|conn| {
                let sql = format!("SELECT {} FROM requests ORDER BY id DESC", COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], read_row)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row??);
                }
                Ok(records)
            })
            .await
    }

    /// Request ids, newest first
    pub async fn ids(&self) -> Result<Vec<RequestId>> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM requests ORDER BY id DESC")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<RequestId>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Record owning a dataset file, if any
    pub async fn find_by_file(&self, file: &str) -> Result<Option<RequestRecord>> {
        let file = file.to_string();
        self.db
            .call(move |conn| {
                let sql = format!("SELECT {} FROM requests WHERE file = ?1", COLUMNS);
                let record = conn.query_row(&sql, [&file], read_row).optional()?;
                record.transpose()
            })
            .await
    }

    /// Subscribe to store changes
    pub fn subscribe(&self, subscriber: Weak<dyn RequestSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    fn notify_subscribers(&self, change: RequestChange) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|weak| {
            if let Some(subscriber) = weak.upgrade() {
                subscriber.on_requests_changed(&change);
                true
            } else {
                false
            }
        });
    }
}

fn not_found(id: RequestId) -> DataError {
    DataError::NotFound(format!("request {}", id))
}

fn fetch(conn: &Connection, id: RequestId) -> Result<Option<RequestRecord>> {
    let sql = format!("SELECT {} FROM requests WHERE id = ?1", COLUMNS);
    let record = conn.query_row(&sql, [id], read_row).optional()?;
    record.transpose()
}

fn store(conn: &Connection, record: &RequestRecord) -> Result<()> {
    let summary = record
        .summary
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "UPDATE requests SET api = ?2, parameters = ?3, status = ?4, star = ?5, start_time = ?6,
                end_time = ?7, status_details = ?8, file = ?9, row_count = ?10, num_bytes = ?11,
                description = ?12, summary = ?13
         WHERE id = ?1",
        params![
            record.id,
            record.api,
            serde_json::to_string(&record.parameters)?,
            record.status.as_str(),
            record.star,
            record.start_time.map(|t| t.to_rfc3339()),
            record.end_time.map(|t| t.to_rfc3339()),
            record.status_details,
            record.file,
            record.row_count.map(|v| v as i64),
            record.num_bytes.map(|v| v as i64),
            record.description,
            summary,
        ],
    )?;
    Ok(())
}

/// Map a row to a record. The outer result is SQLite's, the inner one
/// covers decoding the stored text columns.
fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<RequestRecord>> {
    let id: RequestId = row.get(0)?;
    let api: Option<String> = row.get(1)?;
    let parameters: String = row.get(2)?;
    let status: String = row.get(3)?;
    let star: bool = row.get(4)?;
    let start_time: Option<String> = row.get(5)?;
    let end_time: Option<String> = row.get(6)?;
    let status_details: Option<String> = row.get(7)?;
    let file: Option<String> = row.get(8)?;
    let row_count: Option<i64> = row.get(9)?;
    let num_bytes: Option<i64> = row.get(10)?;
    let description: Option<String> = row.get(11)?;
    let summary: Option<String> = row.get(12)?;

    Ok(decode(
        id,
        api,
        parameters,
        status,
        star,
        (start_time, end_time),
        status_details,
        file,
        (row_count, num_bytes),
        description,
        summary,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode(
    id: RequestId,
    api: Option<String>,
    parameters: String,
    status: String,
    star: bool,
    (start_time, end_time): (Option<String>, Option<String>),
    status_details: Option<String>,
    file: Option<String>,
    (row_count, num_bytes): (Option<i64>, Option<i64>),
    description: Option<String>,
    summary: Option<String>,
) -> Result<RequestRecord> {
    let status = status
        .parse::<RequestStatus>()
        .map_err(|e| DataError::Corrupt {
            name: format!("request {}", id),
            reason: e,
        })?;
    let summary: Option<RequestSummary> = summary.as_deref().map(serde_json::from_str).transpose()?;

    Ok(RequestRecord {
        id,
        api,
        parameters: serde_json::from_str(&parameters)?,
        status,
        star,
        start_time: parse_time(id, start_time)?,
        end_time: parse_time(id, end_time)?,
        status_details,
        file,
        row_count: row_count.map(|v| v.max(0) as u64),
        num_bytes: num_bytes.map(|v| v.max(0) as u64),
        description,
        summary,
    })
}

fn parse_time(id: RequestId, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| DataError::Corrupt {
                    name: format!("request {}", id),
                    reason: format!("bad timestamp '{}': {}", s, e),
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use parking_lot::Mutex;

    fn store() -> RequestStore {
        RequestStore::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_add_pending_assigns_increasing_ids() {
        let store = store();
        let a = store.add_pending().await.unwrap();
        let b = store.add_pending().await.unwrap();
        assert!(b > a);
        assert_eq!(store.get(a).await.unwrap().status, RequestStatus::Pending);
        assert_eq!(store.ids().await.unwrap(), vec![b, a]);
    }

    #[tokio::test]
    async fn test_update_round_trips_all_fields() {
        let store = store();
        let id = store
            .add_pending_with(Some("atl06".to_string()), serde_json::json!({"poly": [1, 2]}))
            .await
            .unwrap();
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(65);
        store
            .update(
                id,
                RequestUpdate {
                    status: Some(RequestStatus::Success),
                    start_time: Some(start),
                    end_time: Some(end),
                    file: Some("atl06_1.arrow".to_string()),
                    row_count: Some(500),
                    num_bytes: Some(1234),
                    star: Some(true),
                    summary: Some(RequestSummary {
                        min_lat: 1.0,
                        max_lat: 2.0,
                        min_lon: 3.0,
                        max_lon: 4.0,
                        min_height: 5.0,
                        max_height: 6.0,
                        low_height: 5.1,
                        high_height: 5.9,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let record = store.get(id).await.unwrap();
        assert_eq!(record.api.as_deref(), Some("atl06"));
        assert_eq!(record.parameters, serde_json::json!({"poly": [1, 2]}));
        assert_eq!(record.status, RequestStatus::Success);
        assert_eq!(record.row_count, Some(500));
        assert!(record.star);
        assert_eq!(record.elapsed_display(), "1 min, 5 secs");
        assert_eq!(record.summary.unwrap().max_height, 6.0);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let store = store();
        let id = store.add_pending().await.unwrap();
        store
            .update(id, RequestUpdate::status(RequestStatus::Error))
            .await
            .unwrap();

        let err = store
            .update(id, RequestUpdate::status(RequestStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidTransition { .. }));
        assert_eq!(store.get(id).await.unwrap().status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn test_end_before_start_is_rejected() {
        let store = store();
        let id = store.add_pending().await.unwrap();
        let now = Utc::now();
        let err = store
            .update(
                id,
                RequestUpdate {
                    start_time: Some(now),
                    end_time: Some(now - chrono::Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidUpdate(_)));
        // nothing was written
        assert_eq!(store.get(id).await.unwrap().start_time, None);
    }

    #[tokio::test]
    async fn test_missing_ids() {
        let store = store();
        assert!(matches!(
            store.update(99, RequestUpdate::default()).await,
            Err(DataError::NotFound(_))
        ));
        assert!(matches!(store.get(99).await, Err(DataError::NotFound(_))));
        assert!(!store.delete(99).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_delete_all() {
        let store = store();
        for _ in 0..3 {
            store.add_pending().await.unwrap();
        }
        let listed: Vec<RequestId> = store.list().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![3, 2, 1]);
        assert_eq!(store.delete_all().await.unwrap(), 3);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_file() {
        let store = store();
        let id = store.add_pending().await.unwrap();
        store
            .update(
                id,
                RequestUpdate {
                    file: Some("atl03x_1.arrow".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.find_by_file("atl03x_1.arrow").await.unwrap().map(|r| r.id), Some(id));
        assert!(store.find_by_file("nope.arrow").await.unwrap().is_none());
    }

    struct Recorder {
        seen: Mutex<Vec<RequestChange>>,
        calls: AtomicUsize,
    }

    impl RequestSubscriber for Recorder {
        fn on_requests_changed(&self, change: &RequestChange) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(change.clone());
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_every_change() {
        let store = store();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        store.subscribe(Arc::downgrade(&recorder) as Weak<dyn RequestSubscriber>);

        let id = store.add_pending().await.unwrap();
        store
            .update(id, RequestUpdate::status(RequestStatus::Processing))
            .await
            .unwrap();
        store.delete(id).await.unwrap();

        assert_eq!(
            *recorder.seen.lock(),
            vec![
                RequestChange::Added(id),
                RequestChange::Updated(id),
                RequestChange::Deleted(id)
            ]
        );
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
    }
}
