use std::time::Duration;

use async_trait::async_trait;
use doc_storage_core::{LockAcquireResult, Locker, StorageError};
use sqlx::postgres::PgPool;
use tracing::{debug, instrument};

use super::expiry_millis;
use crate::storage::{pg_error, Schema};

/// Takes the row when it is free, expired or already ours.
const ACQUIRE_LOCK: &str = "
INSERT INTO doc_locks (space_id, doc_id, holder_id, expires_at_ms) VALUES ($1, $2, $3, $4)
ON CONFLICT (space_id, doc_id) DO UPDATE SET
    holder_id = EXCLUDED.holder_id,
    expires_at_ms = EXCLUDED.expires_at_ms
WHERE doc_locks.holder_id = EXCLUDED.holder_id OR doc_locks.expires_at_ms <= $5
";

/// Lock rows in the `doc_locks` table, shared by every worker on the database.
pub struct PgLocker {
    pool: PgPool,
    schema: Schema,
}

impl PgLocker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: Schema::default(),
        }
    }
}

#[async_trait]
impl Locker for PgLocker {
    fn lock_type(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError> {
        self.schema.ensure(&self.pool).await?;
        let expires_at_ms = expiry_millis(ttl);

        // A second round covers a holder releasing between our upsert and read.
        for _ in 0..2 {
            let now = chrono::Utc::now().timestamp_millis();
            let taken = sqlx::query(ACQUIRE_LOCK)
                .bind(space_id)
                .bind(doc_id)
                .bind(holder_id)
                .bind(expires_at_ms)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(pg_error("acquire lock"))?
                .rows_affected();
            if taken == 1 {
                debug!("Acquired lock on {}/{} for {}", space_id, doc_id, holder_id);
                return Ok(LockAcquireResult::acquired(expires_at_ms / 1000));
            }

            let current: Option<(String, i64)> = sqlx::query_as(
                "SELECT holder_id, expires_at_ms FROM doc_locks WHERE space_id = $1 AND doc_id = $2",
            )
            .bind(space_id)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_error("read lock"))?;

            if let Some((holder, expires)) = current {
                debug!(
                    "Lock on {}/{} held by {} (requested by {})",
                    space_id, doc_id, holder, holder_id
                );
                return Ok(LockAcquireResult::not_acquired(holder, expires / 1000));
            }
        }

        Err(StorageError::Lock(format!(
            "Lock on {}/{} kept changing hands",
            space_id, doc_id
        )))
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
    ) -> Result<bool, StorageError> {
        self.schema.ensure(&self.pool).await?;
        let released = sqlx::query(
            "DELETE FROM doc_locks WHERE space_id = $1 AND doc_id = $2 AND holder_id = $3",
        )
        .bind(space_id)
        .bind(doc_id)
        .bind(holder_id)
        .execute(&self.pool)
        .await
        .map_err(pg_error("release lock"))?
        .rows_affected();
        Ok(released > 0)
    }
}
