use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;

/// Highest job priority. Larger numbers run later.
pub const HIGHEST_PRIORITY: u32 = 0;

/// What a job handler asks the queue to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSignal {
    /// Finished; drop the job.
    Done,
    /// Run again under the same id and priority.
    Repeat,
}

/// Options accepted by [`JobQueue::add`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Stable id; adding a job whose id is already queued is a no-op.
    pub job_id: Option<String>,
    pub priority: u32,
    pub delay: Duration,
}

/// A queued (waiting or running) job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub opts: JobOptions,
}

/// Job queue collaborator used by the merge scheduler.
///
/// The queue does not support changing a job's priority in place; see
/// [`reschedule_with_priority`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Returns the job id.
    async fn add(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<String, StorageError>;

    async fn get(&self, job_id: &str, name: &str) -> Result<Option<JobInfo>, StorageError>;

    /// Remove a waiting job. Returns whether a job was removed.
    async fn remove(&self, job_id: &str, name: &str) -> Result<bool, StorageError>;
}

/// Move a waiting job to `priority` by removing and re-adding it with the same id and
/// payload. Returns `false` when there is no waiting job to move.
pub async fn reschedule_with_priority(
    queue: &dyn JobQueue,
    name: &str,
    job_id: &str,
    priority: u32,
) -> Result<bool, StorageError> {
    let Some(job) = queue.get(job_id, name).await? else {
        return Ok(false);
    };
    if job.opts.priority == priority {
        return Ok(false);
    }

    if !queue.remove(job_id, name).await? {
        debug!("Job {} is already running, not rescheduling", job_id);
        return Ok(false);
    }

    queue
        .add(
            name,
            job.payload,
            JobOptions {
                job_id: Some(job_id.to_string()),
                priority,
                delay: Duration::ZERO,
            },
        )
        .await?;

    debug!(
        "Rescheduled job {} from priority {} to {}",
        job_id, job.opts.priority, priority
    );
    Ok(true)
}
