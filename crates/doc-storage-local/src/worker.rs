use std::sync::Arc;
use std::time::Duration;

use doc_storage_core::{JobSignal, MergeScheduler};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::queue::MemoryJobQueue;

/// Longest a worker sleeps before re-checking the queue.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Drives the merge scheduler: a ticker that scans the backlog every interval and
/// a pool of workers running queued jobs.
pub struct MergeWorker {
    scheduler: Arc<MergeScheduler>,
    queue: Arc<MemoryJobQueue>,
    concurrency: usize,
}

impl MergeWorker {
    pub fn new(scheduler: Arc<MergeScheduler>, queue: Arc<MemoryJobQueue>, concurrency: usize) -> Self {
        Self {
            scheduler,
            queue,
            concurrency: concurrency.max(1),
        }
    }

    /// One scheduler tick: enqueue merge jobs and the backlog gauge job.
    pub async fn tick(&self) {
        match self.scheduler.schedule().await {
            Ok(report) if report.scanned > 0 => info!(
                "Scheduled merges for {} docs ({} urgent, {} escalated, {} failed)",
                report.scanned, report.urgent, report.escalated, report.failed
            ),
            Ok(_) => {}
            Err(e) => warn!("Scheduler tick failed: {}", e),
        }

        if let Err(e) = self.scheduler.schedule_record_pending_count().await {
            warn!("Failed to schedule pending count job: {}", e);
        }
    }

    /// Run one ready job, if any. Returns whether a job ran.
    pub async fn run_once(&self) -> bool {
        let Some(job) = self.queue.claim() else {
            return false;
        };

        let signal = match self.scheduler.handle_job(&job.name, &job.payload).await {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Job {} ({}) failed: {}", job.id, job.name, e);
                JobSignal::Done
            }
        };
        debug!("Job {} finished with {:?}", job.id, signal);
        self.queue.complete(&job, signal);
        true
    }

    /// Run ready jobs until none is left. Returns how many ran.
    #[cfg(test)]
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        while self.run_once().await {
            ran += 1;
        }
        ran
    }

    /// Run the ticker and the workers until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            "Merge worker started: {} workers, tick every {:?}",
            self.concurrency,
            self.scheduler.config().interval
        );

        let mut tasks = vec![tokio::spawn(self.clone().tick_loop(shutdown.clone()))];
        for _ in 0..self.concurrency {
            tasks.push(tokio::spawn(self.clone().work_loop(shutdown.clone())));
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Merge worker task failed: {}", e);
            }
        }
        info!("Merge worker stopped");
    }

    async fn tick_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.scheduler.config().interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn work_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.run_once().await {
                continue;
            }

            let wait = self.queue.next_ready_in().map_or(IDLE_POLL, |d| d.min(IDLE_POLL));
            tokio::select! {
                _ = self.queue.added() => {}
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
