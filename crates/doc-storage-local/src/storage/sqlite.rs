use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use doc_storage_core::{
    allocate_timestamp, initial_push_timestamp, timestamp_from_millis, Broadcaster, DocClock,
    DocClocks, DocRecord, DocStorage, DocUpdate, PendingUpdates, StorageError, Subscription,
    Timestamp, UpdateCallback, UpdateNotifier,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, instrument};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS updates (
    doc_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    data BLOB NOT NULL,
    editor TEXT,
    PRIMARY KEY (doc_id, created_at)
);
CREATE TABLE IF NOT EXISTS snapshots (
    doc_id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    editor TEXT
);
CREATE TABLE IF NOT EXISTS clocks (
    doc_id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL
);
";

/// Inserts the update only when the document has no clock at or after it. Zero rows
/// changed means the candidate lost a race.
const INSERT_UPDATE: &str = "
INSERT INTO updates (doc_id, created_at, data, editor)
SELECT ?1, ?2, ?3, ?4
WHERE NOT EXISTS (SELECT 1 FROM clocks WHERE doc_id = ?1 AND timestamp >= ?2)
";

const ADVANCE_CLOCK: &str = "
INSERT INTO clocks (doc_id, timestamp) VALUES (?1, ?2)
ON CONFLICT(doc_id) DO UPDATE SET timestamp = max(timestamp, excluded.timestamp)
";

const UPSERT_SNAPSHOT: &str = "
INSERT INTO snapshots (doc_id, data, updated_at, editor) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(doc_id) DO UPDATE SET
    data = excluded.data,
    updated_at = excluded.updated_at,
    editor = excluded.editor
WHERE excluded.updated_at > snapshots.updated_at
";

/// Embedded SQL backend, one database file per workspace.
///
/// Ordering is enforced by the database itself, so several connections (or
/// processes) sharing the file stay correct; pushes from one instance are also
/// serialized in-process.
pub struct SqliteDocStorage {
    space_id: String,
    conn: Arc<Mutex<Connection>>,
    push_lock: tokio::sync::Mutex<()>,
    notifier: UpdateNotifier,
}

impl SqliteDocStorage {
    /// Open (creating if needed) `{base_dir}/{space_id}/docs.db`.
    pub fn open(
        base_dir: &Path,
        space_id: &str,
        channel: Option<Arc<dyn Broadcaster>>,
    ) -> Result<Self, StorageError> {
        let dir = base_dir.join(space_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            StorageError::Io(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let conn = Connection::open(dir.join("docs.db")).map_err(sql_error("open database"))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(sql_error("set busy timeout"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(sql_error("configure database"))?;
        conn.execute_batch(SCHEMA)
            .map_err(sql_error("install schema"))?;

        Ok(Self {
            space_id: space_id.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            push_lock: tokio::sync::Mutex::new(()),
            notifier: UpdateNotifier::new(channel),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StorageError::Internal("SQLite connection poisoned".to_string()))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("SQLite task failed: {}", e)))?
    }

    async fn clock_of(&self, doc_id: &str) -> Result<Option<Timestamp>, StorageError> {
        let doc_id = doc_id.to_string();
        let millis = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT timestamp FROM clocks WHERE doc_id = ?1",
                    params![doc_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(sql_error("read clock"))
            })
            .await?;
        Ok(millis.map(timestamp_from_millis))
    }

    async fn insert_update(&self, record: DocRecord) -> Result<(), StorageError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("begin push"))?;
            let millis = record.timestamp.timestamp_millis();

            let inserted = tx
                .execute(
                    INSERT_UPDATE,
                    params![record.doc_id, millis, record.bin, record.editor],
                )
                .map_err(sql_error("insert update"))?;
            if inserted == 0 {
                return Err(StorageError::Conflict(format!(
                    "Doc {} already has an update at or after {}",
                    record.doc_id, millis
                )));
            }

            tx.execute(ADVANCE_CLOCK, params![record.doc_id, millis])
                .map_err(sql_error("advance clock"))?;
            tx.commit().map_err(sql_error("commit push"))
        })
        .await
    }
}

/// Map a driver error, turning uniqueness violations into retryable conflicts.
fn sql_error(step: &'static str) -> impl Fn(rusqlite::Error) -> StorageError {
    move |err| {
        if is_constraint_violation(&err) {
            return StorageError::Conflict(format!("Failed to {}: {}", step, err));
        }
        StorageError::Io(format!("Failed to {}: {}", step, err))
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => code.code == ErrorCode::ConstraintViolation,
        _ => false,
    }
}

fn record_from_row(doc_id: &str, row: &rusqlite::Row<'_>) -> rusqlite::Result<DocRecord> {
    Ok(DocRecord {
        doc_id: doc_id.to_string(),
        bin: row.get(0)?,
        timestamp: timestamp_from_millis(row.get(1)?),
        editor: row.get(2)?,
    })
}

#[async_trait]
impl DocStorage for SqliteDocStorage {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    #[instrument(skip(self, update), level = "debug", fields(doc_id = %update.doc_id, len = update.bin.len()))]
    async fn push_doc_update(
        &self,
        update: DocUpdate,
        origin: Option<&str>,
    ) -> Result<DocClock, StorageError> {
        let DocUpdate {
            doc_id,
            bin,
            editor,
        } = update;

        let timestamp = {
            let _guard = self.push_lock.lock().await;
            let initial = initial_push_timestamp(self.clock_of(&doc_id).await?);
            allocate_timestamp(&doc_id, initial, |candidate| {
                self.insert_update(DocRecord {
                    doc_id: doc_id.clone(),
                    bin: bin.clone(),
                    timestamp: candidate,
                    editor: editor.clone(),
                })
            })
            .await?
        };

        debug!("Inserted update of doc {} at {}", doc_id, timestamp.timestamp_millis());
        self.notifier.notify(
            DocRecord {
                doc_id: doc_id.clone(),
                bin,
                timestamp,
                editor,
            },
            origin,
        );
        Ok(DocClock { doc_id, timestamp })
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>, StorageError> {
        let doc_id = doc_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT data, created_at, editor FROM updates WHERE doc_id = ?1 ORDER BY created_at",
                )
                .map_err(sql_error("prepare update query"))?;
            let rows = stmt
                .query_map(params![doc_id], |row| record_from_row(&doc_id, row))
                .map_err(sql_error("query updates"))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(sql_error("read updates"))
        })
        .await
    }

    #[instrument(skip(self, updates), level = "debug", fields(count = updates.len()))]
    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocRecord],
    ) -> Result<u64, StorageError> {
        let doc_id = doc_id.to_string();
        let timestamps: Vec<i64> = updates
            .iter()
            .map(|u| u.timestamp.timestamp_millis())
            .collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_error("begin reap"))?;
            let mut removed = 0u64;
            {
                let mut stmt = tx
                    .prepare("DELETE FROM updates WHERE doc_id = ?1 AND created_at = ?2")
                    .map_err(sql_error("prepare reap"))?;
                for millis in &timestamps {
                    removed += stmt
                        .execute(params![doc_id, millis])
                        .map_err(sql_error("delete update"))? as u64;
                }
            }
            tx.commit().map_err(sql_error("commit reap"))?;
            Ok(removed)
        })
        .await
    }

    async fn get_update_count(&self, doc_id: &str) -> Result<u64, StorageError> {
        let doc_id = doc_id.to_string();
        let count = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM updates WHERE doc_id = ?1",
                    params![doc_id],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(sql_error("count updates"))
            })
            .await?;
        Ok(count as u64)
    }

    async fn pending_update_counts(&self) -> Result<Vec<PendingUpdates>, StorageError> {
        let space_id = self.space_id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT doc_id, COUNT(*) FROM updates GROUP BY doc_id")
                .map_err(sql_error("prepare backlog query"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(PendingUpdates {
                        space_id: space_id.clone(),
                        doc_id: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                    })
                })
                .map_err(sql_error("query backlog"))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(sql_error("read backlog"))
        })
        .await
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        let doc_id = doc_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT data, updated_at, editor FROM snapshots WHERE doc_id = ?1",
                params![doc_id],
                |row| record_from_row(&doc_id, row),
            )
            .optional()
            .map_err(sql_error("read snapshot"))
        })
        .await
    }

    #[instrument(skip(self, snapshot), level = "debug", fields(doc_id = %snapshot.doc_id, len = snapshot.bin.len()))]
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let snapshot = snapshot.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("begin snapshot write"))?;
            let millis = snapshot.timestamp.timestamp_millis();

            let written = tx
                .execute(
                    UPSERT_SNAPSHOT,
                    params![snapshot.doc_id, snapshot.bin, millis, snapshot.editor],
                )
                .map_err(sql_error("write snapshot"))?;
            if written == 0 {
                return Ok(false);
            }

            tx.execute(ADVANCE_CLOCK, params![snapshot.doc_id, millis])
                .map_err(sql_error("advance clock"))?;
            tx.commit().map_err(sql_error("commit snapshot write"))?;
            Ok(true)
        })
        .await
    }

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>, StorageError> {
        Ok(self.clock_of(doc_id).await?.map(|timestamp| DocClock {
            doc_id: doc_id.to_string(),
            timestamp,
        }))
    }

    async fn get_doc_timestamps(
        &self,
        after: Option<Timestamp>,
    ) -> Result<DocClocks, StorageError> {
        let after = after.map_or(i64::MIN, |t| t.timestamp_millis());
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT doc_id, timestamp FROM clocks WHERE timestamp > ?1")
                .map_err(sql_error("prepare clock query"))?;
            let rows = stmt
                .query_map(params![after], |row| {
                    Ok((row.get::<_, String>(0)?, timestamp_from_millis(row.get(1)?)))
                })
                .map_err(sql_error("query clocks"))?;
            rows.collect::<Result<DocClocks, _>>()
                .map_err(sql_error("read clocks"))
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        let doc_id = doc_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_error("begin delete"))?;
            tx.execute("DELETE FROM updates WHERE doc_id = ?1", params![doc_id])
                .map_err(sql_error("delete updates"))?;
            tx.execute("DELETE FROM snapshots WHERE doc_id = ?1", params![doc_id])
                .map_err(sql_error("delete snapshot"))?;
            tx.execute("DELETE FROM clocks WHERE doc_id = ?1", params![doc_id])
                .map_err(sql_error("delete clock"))?;
            tx.commit().map_err(sql_error("commit delete"))
        })
        .await
    }

    fn subscribe_doc_update(&self, callback: UpdateCallback) -> Subscription {
        self.notifier.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use tempfile::TempDir;

    fn setup() -> (SqliteDocStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = SqliteDocStorage::open(temp_dir.path(), "ws", None).unwrap();
        (storage, temp_dir)
    }

    fn shared() -> (Arc<dyn DocStorage>, TempDir) {
        let (storage, temp) = setup();
        (Arc::new(storage), temp)
    }

    #[tokio::test]
    async fn test_push_and_read() {
        let (storage, _temp) = shared();
        contract::push_and_read(storage).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pushes() {
        let (storage, _temp) = shared();
        contract::concurrent_pushes(storage).await;
    }

    #[tokio::test]
    async fn test_push_after_future_snapshot() {
        let (storage, _temp) = shared();
        contract::push_after_future_snapshot(storage).await;
    }

    #[tokio::test]
    async fn test_snapshot_monotonic() {
        let (storage, _temp) = shared();
        contract::snapshot_monotonic(storage).await;
    }

    #[tokio::test]
    async fn test_timestamps_after() {
        let (storage, _temp) = shared();
        contract::timestamps_after(storage).await;
    }

    #[tokio::test]
    async fn test_mark_merged_and_counts() {
        let (storage, _temp) = shared();
        contract::mark_merged_and_counts(storage).await;
    }

    #[tokio::test]
    async fn test_delete_doc() {
        let (storage, _temp) = shared();
        contract::delete_doc(storage).await;
    }

    #[tokio::test]
    async fn test_subscribers_see_pushes() {
        let (storage, _temp) = shared();
        contract::subscribers_see_pushes(storage).await;
    }

    #[tokio::test]
    async fn test_conditional_insert_rejects_stale_candidate() {
        let (storage, _temp) = setup();
        let clock = storage
            .push_doc_update(DocUpdate::new("doc", vec![1]), None)
            .await
            .unwrap();

        for stale in [clock.timestamp, timestamp_from_millis(1)] {
            let err = storage
                .insert_update(DocRecord::new("doc", vec![2], stale))
                .await
                .unwrap_err();
            assert!(err.is_conflict());
        }
        assert_eq!(storage.get_update_count("doc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_two_connections_share_one_file() {
        let temp_dir = TempDir::new().unwrap();
        let first = SqliteDocStorage::open(temp_dir.path(), "ws", None).unwrap();
        let second = SqliteDocStorage::open(temp_dir.path(), "ws", None).unwrap();

        let a = first
            .push_doc_update(DocUpdate::new("doc", vec![1]), None)
            .await
            .unwrap();
        let b = second
            .push_doc_update(DocUpdate::new("doc", vec![2]), None)
            .await
            .unwrap();
        assert!(b.timestamp > a.timestamp);

        // The stale candidate computed by a connection that has not seen the other
        // push is refused by the database.
        let err = first
            .insert_update(DocRecord::new("doc", vec![3], a.timestamp))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(first.get_update_count("doc").await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reaping_connection_does_not_lose_updates() {
        let temp_dir = TempDir::new().unwrap();
        let writer: Arc<dyn DocStorage> =
            Arc::new(SqliteDocStorage::open(temp_dir.path(), "ws", None).unwrap());
        let reaper: Arc<dyn DocStorage> =
            Arc::new(SqliteDocStorage::open(temp_dir.path(), "ws", None).unwrap());

        contract::reaping_keeps_concurrent_pushes(writer, reaper, 200).await;
    }
}
