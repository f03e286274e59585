//! Background merge scheduling.
//!
//! Every tick scans the pending-update backlog of each workspace and makes sure a
//! compaction job exists per document, escalating documents whose backlog crossed the
//! threshold. The scan keeps no state between ticks; everything that must survive a
//! tick lives in the job queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::compaction::{CompactionOutcome, DocCompactor};
use crate::doc::PendingUpdates;
use crate::error::StorageError;
use crate::job::{reschedule_with_priority, JobOptions, JobQueue, JobSignal, HIGHEST_PRIORITY};
use crate::metrics::{MetricsSink, PENDING_UPDATES_GAUGE};

pub const MERGE_PENDING_UPDATES_JOB: &str = "doc.mergePendingDocUpdates";
pub const RECORD_PENDING_COUNT_JOB: &str = "doc.recordPendingDocUpdatesCount";
pub const RECORD_PENDING_COUNT_JOB_ID: &str = "doc:record-pending-updates-count";

/// Payload of a merge job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeJob {
    pub workspace_id: String,
    pub doc_id: String,
}

impl MergeJob {
    pub fn new(workspace_id: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            doc_id: doc_id.into(),
        }
    }

    /// Stable queue id, so rescanning the same backlog never duplicates the job.
    pub fn job_id(&self) -> String {
        format!(
            "doc:merge-pending-updates:{}:{}",
            self.workspace_id, self.doc_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Backlog above which a document is compacted at the highest priority.
    pub threshold: u64,
    /// Interval between scans.
    pub interval: Duration,
    /// Priority of documents at or below the threshold.
    pub normal_priority: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            interval: Duration::from_secs(30),
            normal_priority: 100,
        }
    }
}

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Documents with a non-empty backlog.
    pub scanned: usize,
    /// Documents above the threshold.
    pub urgent: usize,
    /// Jobs moved to the highest priority.
    pub escalated: usize,
    /// Documents whose job could not be queued this tick.
    pub failed: usize,
}

pub struct MergeScheduler {
    spaces: HashMap<String, Arc<DocCompactor>>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
}

impl MergeScheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        metrics: Arc<dyn MetricsSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            spaces: HashMap::new(),
            queue,
            metrics,
            config,
        }
    }

    /// Register the compactor of a workspace.
    pub fn add_space(&mut self, compactor: Arc<DocCompactor>) {
        self.spaces
            .insert(compactor.space_id().to_string(), compactor);
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Scan every workspace's backlog and enqueue or escalate merge jobs.
    #[instrument(skip(self), level = "debug")]
    pub async fn schedule(&self) -> Result<TickReport, StorageError> {
        let mut report = TickReport::default();

        for (space_id, compactor) in &self.spaces {
            let pending = match compactor.storage().pending_update_counts().await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!("Failed to read backlog of workspace {}: {}", space_id, e);
                    continue;
                }
            };

            for doc in pending {
                report.scanned += 1;
                let urgent = doc.count > self.config.threshold;
                if urgent {
                    report.urgent += 1;
                }
                match self.schedule_doc(&doc, urgent).await {
                    Ok(true) => report.escalated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            "Failed to schedule merge of doc {}/{}: {}",
                            doc.space_id, doc.doc_id, e
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        debug!(
            "Scheduler tick: {} docs pending, {} urgent, {} escalated, {} failed",
            report.scanned, report.urgent, report.escalated, report.failed
        );
        Ok(report)
    }

    /// Returns whether an existing job was escalated.
    async fn schedule_doc(&self, doc: &PendingUpdates, urgent: bool) -> Result<bool, StorageError> {
        let job = MergeJob::new(&doc.space_id, &doc.doc_id);
        let job_id = job.job_id();

        if urgent
            && reschedule_with_priority(
                self.queue.as_ref(),
                MERGE_PENDING_UPDATES_JOB,
                &job_id,
                HIGHEST_PRIORITY,
            )
            .await?
        {
            info!(
                "Escalated merge of doc {}/{} ({} pending updates)",
                doc.space_id, doc.doc_id, doc.count
            );
            return Ok(true);
        }

        let payload = serde_json::to_value(&job).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize merge job: {}", e))
        })?;
        let priority = if urgent {
            HIGHEST_PRIORITY
        } else {
            self.config.normal_priority
        };

        self.queue
            .add(
                MERGE_PENDING_UPDATES_JOB,
                payload,
                JobOptions {
                    job_id: Some(job_id),
                    priority,
                    delay: Duration::ZERO,
                },
            )
            .await?;
        Ok(false)
    }

    /// Merge job handler: one compaction pass, then `Repeat` while the backlog is
    /// still above the threshold.
    #[instrument(skip(self), level = "debug")]
    pub async fn merge_pending_doc_updates(&self, job: &MergeJob) -> Result<JobSignal, StorageError> {
        let Some(compactor) = self.spaces.get(&job.workspace_id) else {
            warn!(
                "Merge job for unknown workspace {}, dropping",
                job.workspace_id
            );
            return Ok(JobSignal::Done);
        };

        let outcome = compactor.compact(&job.doc_id).await?;
        if outcome == CompactionOutcome::Locked {
            // Someone else is compacting; the next tick re-enqueues if needed.
            debug!(
                "Doc {}/{} is locked, deferring to next tick",
                job.workspace_id, job.doc_id
            );
            return Ok(JobSignal::Done);
        }

        let updates_left = compactor.storage().get_update_count(&job.doc_id).await?;
        if updates_left > self.config.threshold {
            Ok(JobSignal::Repeat)
        } else {
            Ok(JobSignal::Done)
        }
    }

    /// Enqueue the backlog gauge job; the fixed id keeps one in flight at a time.
    pub async fn schedule_record_pending_count(&self) -> Result<(), StorageError> {
        self.queue
            .add(
                RECORD_PENDING_COUNT_JOB,
                serde_json::json!({}),
                JobOptions {
                    job_id: Some(RECORD_PENDING_COUNT_JOB_ID.to_string()),
                    priority: self.config.normal_priority,
                    delay: self.config.interval,
                },
            )
            .await?;
        Ok(())
    }

    /// Sum the backlog of all workspaces and report it as a gauge.
    pub async fn record_pending_doc_updates_count(&self) -> Result<u64, StorageError> {
        let mut total = 0u64;
        for compactor in self.spaces.values() {
            let pending = compactor.storage().pending_update_counts().await?;
            total += pending.iter().map(|p| p.count).sum::<u64>();
        }

        if let Err(e) = self.metrics.gauge(PENDING_UPDATES_GAUGE, total as f64) {
            warn!("Failed to record pending updates gauge: {}", e);
        }
        Ok(total)
    }

    /// Dispatch a claimed job to its handler.
    pub async fn handle_job(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<JobSignal, StorageError> {
        match name {
            MERGE_PENDING_UPDATES_JOB => {
                let job: MergeJob = serde_json::from_value(payload.clone()).map_err(|e| {
                    StorageError::Serialization(format!("Invalid merge job payload: {}", e))
                })?;
                self.merge_pending_doc_updates(&job).await
            }
            RECORD_PENDING_COUNT_JOB => {
                self.record_pending_doc_updates_count().await?;
                Ok(JobSignal::Done)
            }
            other => Err(StorageError::Queue(format!("Unknown job {}", other))),
        }
    }
}
