use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doc_storage_core::{
    allocate_timestamp, initial_push_timestamp, timestamp_from_millis, Broadcaster, DocClock,
    DocClocks, DocRecord, DocStorage, DocUpdate, PendingUpdates, StorageError, Subscription,
    Timestamp, UpdateCallback, UpdateNotifier,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS doc_updates (
        space_id TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        data BYTEA NOT NULL,
        editor TEXT,
        PRIMARY KEY (space_id, doc_id, created_at)
    )",
    "CREATE TABLE IF NOT EXISTS doc_snapshots (
        space_id TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        data BYTEA NOT NULL,
        updated_at BIGINT NOT NULL,
        editor TEXT,
        PRIMARY KEY (space_id, doc_id)
    )",
    "CREATE TABLE IF NOT EXISTS doc_clocks (
        space_id TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        updated_at BIGINT NOT NULL,
        PRIMARY KEY (space_id, doc_id)
    )",
    "CREATE TABLE IF NOT EXISTS doc_locks (
        space_id TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        holder_id TEXT NOT NULL,
        expires_at_ms BIGINT NOT NULL,
        PRIMARY KEY (space_id, doc_id)
    )",
];

/// Moves the clock forward to the candidate only when it is strictly newer. The row
/// lock taken by the upsert serializes racing pushes; zero rows means the candidate
/// lost.
const CLAIM_CLOCK: &str = "
INSERT INTO doc_clocks (space_id, doc_id, updated_at) VALUES ($1, $2, $3)
ON CONFLICT (space_id, doc_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
WHERE doc_clocks.updated_at < EXCLUDED.updated_at
";

const ADVANCE_CLOCK: &str = "
INSERT INTO doc_clocks (space_id, doc_id, updated_at) VALUES ($1, $2, $3)
ON CONFLICT (space_id, doc_id) DO UPDATE
SET updated_at = GREATEST(doc_clocks.updated_at, EXCLUDED.updated_at)
";

const UPSERT_SNAPSHOT: &str = "
INSERT INTO doc_snapshots (space_id, doc_id, data, updated_at, editor)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (space_id, doc_id) DO UPDATE SET
    data = EXCLUDED.data,
    updated_at = EXCLUDED.updated_at,
    editor = EXCLUDED.editor
WHERE doc_snapshots.updated_at < EXCLUDED.updated_at
";

/// Lazily connecting pool for `database_url`.
pub fn connect_pool(database_url: &str) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy(database_url)
        .map_err(|e| StorageError::InvalidArgument(format!("Invalid database URL: {}", e)))
}

/// Tables are created once per pool user, on first use.
#[derive(Debug, Default)]
pub(crate) struct Schema(OnceCell<()>);

impl Schema {
    pub(crate) async fn ensure(&self, pool: &PgPool) -> Result<(), StorageError> {
        self.0
            .get_or_try_init(|| async {
                // Concurrent CREATE IF NOT EXISTS can still collide in the catalog.
                let mut tx = pool.begin().await.map_err(pg_error("install schema"))?;
                sqlx::query("SELECT pg_advisory_xact_lock(hashtext('doc_storage_schema'))")
                    .execute(&mut *tx)
                    .await
                    .map_err(pg_error("install schema"))?;
                for statement in SCHEMA {
                    sqlx::query(statement)
                        .execute(&mut *tx)
                        .await
                        .map_err(pg_error("install schema"))?;
                }
                tx.commit().await.map_err(pg_error("install schema"))?;
                info!("PostgreSQL schema ready");
                Ok::<_, StorageError>(())
            })
            .await?;
        Ok(())
    }
}

/// Relational server backend. All workspaces share the tables, keyed by space id.
///
/// Ordering is enforced by the database: a push claims the document clock with a
/// conditional upsert in the same transaction as the insert, so workers on other
/// hosts stay correct.
pub struct PostgresDocStorage {
    space_id: String,
    pool: PgPool,
    schema: Schema,
    push_lock: Mutex<()>,
    notifier: UpdateNotifier,
}

impl PostgresDocStorage {
    pub fn new(pool: PgPool, space_id: &str, channel: Option<Arc<dyn Broadcaster>>) -> Self {
        Self {
            space_id: space_id.to_string(),
            pool,
            schema: Schema::default(),
            push_lock: Mutex::new(()),
            notifier: UpdateNotifier::new(channel),
        }
    }

    async fn pool(&self) -> Result<&PgPool, StorageError> {
        self.schema.ensure(&self.pool).await?;
        Ok(&self.pool)
    }

    async fn clock_of(&self, doc_id: &str) -> Result<Option<Timestamp>, StorageError> {
        let millis: Option<i64> = sqlx::query_scalar(
            "SELECT updated_at FROM doc_clocks WHERE space_id = $1 AND doc_id = $2",
        )
        .bind(&self.space_id)
        .bind(doc_id)
        .fetch_optional(self.pool().await?)
        .await
        .map_err(pg_error("read clock"))?;
        Ok(millis.map(timestamp_from_millis))
    }

    async fn insert_update(&self, record: &DocRecord) -> Result<(), StorageError> {
        let millis = record.timestamp.timestamp_millis();
        let mut tx = self
            .pool()
            .await?
            .begin()
            .await
            .map_err(pg_error("begin push"))?;

        let claimed = sqlx::query(CLAIM_CLOCK)
            .bind(&self.space_id)
            .bind(&record.doc_id)
            .bind(millis)
            .execute(&mut *tx)
            .await
            .map_err(pg_error("claim clock"))?
            .rows_affected();
        if claimed == 0 {
            return Err(StorageError::Conflict(format!(
                "Doc {} already has an update at or after {}",
                record.doc_id, millis
            )));
        }

        sqlx::query(
            "INSERT INTO doc_updates (space_id, doc_id, created_at, data, editor)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&self.space_id)
        .bind(&record.doc_id)
        .bind(millis)
        .bind(&record.bin)
        .bind(&record.editor)
        .execute(&mut *tx)
        .await
        .map_err(pg_error("insert update"))?;

        tx.commit().await.map_err(pg_error("commit push"))
    }
}

/// Map a driver error, turning uniqueness violations into retryable conflicts.
pub(crate) fn pg_error(step: &'static str) -> impl Fn(sqlx::Error) -> StorageError {
    move |err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Conflict(format!("Failed to {}: {}", step, err))
        }
        _ => StorageError::Io(format!("Failed to {}: {}", step, err)),
    }
}

fn record_from_row(doc_id: &str, row: &PgRow) -> Result<DocRecord, StorageError> {
    let decode = |e: sqlx::Error| StorageError::Serialization(format!("Failed to decode row: {}", e));
    Ok(DocRecord {
        doc_id: doc_id.to_string(),
        bin: row.try_get("data").map_err(decode)?,
        timestamp: timestamp_from_millis(row.try_get("ts").map_err(decode)?),
        editor: row.try_get("editor").map_err(decode)?,
    })
}

#[async_trait]
impl DocStorage for PostgresDocStorage {
    fn backend_name(&self) -> &'static str {
        "postgres"
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
                let record = DocRecord {
                    doc_id: doc_id.clone(),
                    bin: bin.clone(),
                    timestamp: candidate,
                    editor: editor.clone(),
                };
                async move { self.insert_update(&record).await }
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
        let rows = sqlx::query(
            "SELECT data, created_at AS ts, editor FROM doc_updates
             WHERE space_id = $1 AND doc_id = $2 ORDER BY created_at",
        )
        .bind(&self.space_id)
        .bind(doc_id)
        .fetch_all(self.pool().await?)
        .await
        .map_err(pg_error("query updates"))?;

        rows.iter().map(|row| record_from_row(doc_id, row)).collect()
    }

    #[instrument(skip(self, updates), level = "debug", fields(count = updates.len()))]
    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocRecord],
    ) -> Result<u64, StorageError> {
        let timestamps: Vec<i64> = updates
            .iter()
            .map(|u| u.timestamp.timestamp_millis())
            .collect();

        let removed = sqlx::query(
            "DELETE FROM doc_updates
             WHERE space_id = $1 AND doc_id = $2 AND created_at = ANY($3)",
        )
        .bind(&self.space_id)
        .bind(doc_id)
        .bind(&timestamps)
        .execute(self.pool().await?)
        .await
        .map_err(pg_error("delete updates"))?
        .rows_affected();
        Ok(removed)
    }

    async fn get_update_count(&self, doc_id: &str) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM doc_updates WHERE space_id = $1 AND doc_id = $2",
        )
        .bind(&self.space_id)
        .bind(doc_id)
        .fetch_one(self.pool().await?)
        .await
        .map_err(pg_error("count updates"))?;
        Ok(count as u64)
    }

    async fn pending_update_counts(&self) -> Result<Vec<PendingUpdates>, StorageError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT doc_id, COUNT(*) FROM doc_updates WHERE space_id = $1 GROUP BY doc_id",
        )
        .bind(&self.space_id)
        .fetch_all(self.pool().await?)
        .await
        .map_err(pg_error("query backlog"))?;

        Ok(rows
            .into_iter()
            .map(|(doc_id, count)| PendingUpdates {
                space_id: self.space_id.clone(),
                doc_id,
                count: count as u64,
            })
            .collect())
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT data, updated_at AS ts, editor FROM doc_snapshots
             WHERE space_id = $1 AND doc_id = $2",
        )
        .bind(&self.space_id)
        .bind(doc_id)
        .fetch_optional(self.pool().await?)
        .await
        .map_err(pg_error("read snapshot"))?;

        row.map(|row| record_from_row(doc_id, &row)).transpose()
    }

    #[instrument(skip(self, snapshot), level = "debug", fields(doc_id = %snapshot.doc_id, len = snapshot.bin.len()))]
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let millis = snapshot.timestamp.timestamp_millis();
        let mut tx = self
            .pool()
            .await?
            .begin()
            .await
            .map_err(pg_error("begin snapshot write"))?;

        let written = sqlx::query(UPSERT_SNAPSHOT)
            .bind(&self.space_id)
            .bind(&snapshot.doc_id)
            .bind(&snapshot.bin)
            .bind(millis)
            .bind(&snapshot.editor)
            .execute(&mut *tx)
            .await
            .map_err(pg_error("write snapshot"))?
            .rows_affected();
        if written == 0 {
            return Ok(false);
        }

        sqlx::query(ADVANCE_CLOCK)
            .bind(&self.space_id)
            .bind(&snapshot.doc_id)
            .bind(millis)
            .execute(&mut *tx)
            .await
            .map_err(pg_error("advance clock"))?;
        tx.commit().await.map_err(pg_error("commit snapshot write"))?;
        Ok(true)
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
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT doc_id, updated_at FROM doc_clocks WHERE space_id = $1 AND updated_at > $2",
        )
        .bind(&self.space_id)
        .bind(after)
        .fetch_all(self.pool().await?)
        .await
        .map_err(pg_error("query clocks"))?;

        Ok(rows
            .into_iter()
            .map(|(doc_id, millis)| (doc_id, timestamp_from_millis(millis)))
            .collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        let mut tx = self
            .pool()
            .await?
            .begin()
            .await
            .map_err(pg_error("begin delete"))?;
        for table in ["doc_updates", "doc_snapshots", "doc_clocks"] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE space_id = $1 AND doc_id = $2",
                table
            ))
            .bind(&self.space_id)
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(pg_error("delete doc"))?;
        }
        tx.commit().await.map_err(pg_error("commit delete"))
    }

    fn subscribe_doc_update(&self, callback: UpdateCallback) -> Subscription {
        self.notifier.subscribe(callback)
    }
}

/// Connection string of a scratch database for the tests below; they are skipped
/// when it is unset.
#[cfg(test)]
pub(crate) fn test_database_url() -> Option<String> {
    std::env::var("DOC_STORAGE_TEST_DATABASE_URL").ok()
}
