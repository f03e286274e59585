use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use doc_storage_core::{JobInfo, JobOptions, JobQueue, JobSignal, StorageError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument};

type JobKey = (String, String);

#[derive(Debug)]
struct Waiting {
    info: JobInfo,
    ready_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: HashMap<JobKey, Waiting>,
    active: HashMap<JobKey, JobInfo>,
    seq: u64,
}

/// In-process priority job queue.
///
/// Jobs are keyed by `(name, id)`; adding a job whose id is waiting or running is a
/// no-op. Ready jobs are claimed lowest priority number first, then in insertion
/// order.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    added: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take the next ready job and mark it running.
    pub fn claim(&self) -> Option<JobInfo> {
        let mut state = self.state();
        let now = Instant::now();

        let key = state
            .waiting
            .iter()
            .filter(|(_, job)| job.ready_at <= now)
            .min_by_key(|(_, job)| (job.info.opts.priority, job.seq))
            .map(|(key, _)| key.clone())?;

        let job = state.waiting.remove(&key)?;
        state.active.insert(key, job.info.clone());
        Some(job.info)
    }

    /// Finish a claimed job. `Repeat` puts it back under the same id and priority.
    pub fn complete(&self, job: &JobInfo, signal: JobSignal) {
        let key = (job.name.clone(), job.id.clone());
        let mut state = self.state();
        state.active.remove(&key);

        if signal == JobSignal::Repeat {
            debug!("Repeating job {}", job.id);
            let opts = JobOptions {
                job_id: Some(job.id.clone()),
                priority: job.opts.priority,
                delay: Duration::ZERO,
            };
            Self::enqueue(&mut state, &job.name, job.payload.clone(), opts);
            drop(state);
            self.added.notify_one();
        }
    }

    /// Time until the next waiting job becomes ready, if any is waiting.
    pub fn next_ready_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.state()
            .waiting
            .values()
            .map(|job| job.ready_at.saturating_duration_since(now))
            .min()
    }

    /// Wait until a job is added.
    pub async fn added(&self) {
        self.added.notified().await;
    }

    #[cfg(test)]
    pub fn waiting_count(&self) -> usize {
        self.state().waiting.len()
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    fn enqueue(
        state: &mut QueueState,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> (String, bool) {
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = (name.to_string(), id.clone());

        if state.waiting.contains_key(&key) || state.active.contains_key(&key) {
            return (id, false);
        }

        state.seq += 1;
        let seq = state.seq;
        let ready_at = Instant::now() + opts.delay;
        state.waiting.insert(
            key,
            Waiting {
                info: JobInfo {
                    id: id.clone(),
                    name: name.to_string(),
                    payload,
                    opts: JobOptions {
                        job_id: Some(id.clone()),
                        ..opts
                    },
                },
                ready_at,
                seq,
            },
        );
        (id, true)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    #[instrument(skip(self, payload), level = "debug")]
    async fn add(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<String, StorageError> {
        let (id, added) = Self::enqueue(&mut self.state(), name, payload, opts);
        if added {
            self.added.notify_one();
        } else {
            debug!("Job {} already queued", id);
        }
        Ok(id)
    }

    async fn get(&self, job_id: &str, name: &str) -> Result<Option<JobInfo>, StorageError> {
        let key = (name.to_string(), job_id.to_string());
        let state = self.state();
        Ok(state
            .waiting
            .get(&key)
            .map(|job| job.info.clone())
            .or_else(|| state.active.get(&key).cloned()))
    }

    async fn remove(&self, job_id: &str, name: &str) -> Result<bool, StorageError> {
        let key = (name.to_string(), job_id.to_string());
        Ok(self.state().waiting.remove(&key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc_storage_core::reschedule_with_priority;
    use serde_json::json;

    fn opts(id: &str, priority: u32) -> JobOptions {
        JobOptions {
            job_id: Some(id.to_string()),
            priority,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_claims_by_priority_then_insertion() {
        let queue = MemoryJobQueue::new();
        queue.add("job", json!(1), opts("a", 100)).await.unwrap();
        queue.add("job", json!(2), opts("b", 0)).await.unwrap();
        queue.add("job", json!(3), opts("c", 100)).await.unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.claim()).map(|j| j.id).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert_eq!(queue.active_count(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_ignored() {
        let queue = MemoryJobQueue::new();
        queue.add("job", json!({"v": 1}), opts("a", 100)).await.unwrap();
        queue.add("job", json!({"v": 2}), opts("a", 0)).await.unwrap();
        assert_eq!(queue.waiting_count(), 1);

        let job = queue.get("a", "job").await.unwrap().unwrap();
        assert_eq!(job.payload, json!({"v": 1}));
        assert_eq!(job.opts.priority, 100);

        // Same id under another name is a different job.
        queue.add("other", json!(null), opts("a", 100)).await.unwrap();
        assert_eq!(queue.waiting_count(), 2);
    }

    #[tokio::test]
    async fn test_running_job_is_not_removed_or_duplicated() {
        let queue = MemoryJobQueue::new();
        queue.add("job", json!(1), opts("a", 100)).await.unwrap();
        let claimed = queue.claim().unwrap();

        assert!(!queue.remove("a", "job").await.unwrap());
        queue.add("job", json!(1), opts("a", 100)).await.unwrap();
        assert_eq!(queue.waiting_count(), 0);

        queue.complete(&claimed, JobSignal::Done);
        assert_eq!(queue.active_count(), 0);
        assert!(queue.get("a", "job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeat_requeues_with_same_priority() {
        let queue = MemoryJobQueue::new();
        queue.add("job", json!(1), opts("a", 0)).await.unwrap();
        let claimed = queue.claim().unwrap();

        queue.complete(&claimed, JobSignal::Repeat);
        let again = queue.claim().unwrap();
        assert_eq!(again.id, "a");
        assert_eq!(again.opts.priority, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_waits() {
        let queue = MemoryJobQueue::new();
        queue
            .add(
                "job",
                json!(null),
                JobOptions {
                    job_id: None,
                    priority: 0,
                    delay: Duration::from_secs(30),
                },
            )
            .await
            .unwrap();

        assert!(queue.claim().is_none());
        assert_eq!(queue.next_ready_in(), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(queue.claim().is_some());
    }

    #[tokio::test]
    async fn test_reschedule_moves_waiting_job() {
        let queue = MemoryJobQueue::new();
        queue.add("job", json!({"doc": "x"}), opts("a", 100)).await.unwrap();
        queue.add("job", json!({"doc": "y"}), opts("b", 100)).await.unwrap();

        assert!(reschedule_with_priority(&queue, "job", "b", 0).await.unwrap());
        // Already at the target priority.
        assert!(!reschedule_with_priority(&queue, "job", "b", 0).await.unwrap());
        // Nothing queued under that id.
        assert!(!reschedule_with_priority(&queue, "job", "zzz", 0).await.unwrap());

        let first = queue.claim().unwrap();
        assert_eq!(first.id, "b");
        assert_eq!(first.payload, json!({"doc": "y"}));
    }
}
