//! Core traits and engines for per-document CRDT update-log storage.
//!
//! This crate defines the abstractions shared between storage backends:
//! - `DocStorage`: update log, snapshot store and clock table of one workspace
//! - `Locker`: per-document exclusive lock for compaction
//! - `Broadcaster`: update fan-out between contexts sharing a storage root
//! - `JobQueue`: collaborator used by the merge scheduler
//! - `DocMerger`: the opaque CRDT merge function
//!
//! and the backend-independent machinery built on them: timestamp allocation,
//! compaction, merge scheduling, replicas and crawl validation.

mod broadcast;
mod compaction;
mod crawl;
mod doc;
mod error;
mod hub;
mod job;
mod lock;
mod merge;
mod metrics;
mod replica;
mod scheduler;
mod storage;

pub use broadcast::{Broadcaster, ChannelBridge, ChannelMessage, LocalChannel, UpdateNotifier};
pub use compaction::{CompactionConfig, CompactionOutcome, DocCompactor};
pub use crawl::{normalize_crawl_result, BlockInfo, ContentExtractor, CrawlResult, DocCrawler};
pub use doc::{
    next_timestamp, now_timestamp, timestamp_from_millis, DocClock, DocClocks, DocRecord,
    DocUpdate, PendingUpdates, Timestamp,
};
pub use error::StorageError;
pub use hub::{DocUpdateEvent, Subscription, UpdateCallback, UpdateHub};
pub use job::{
    reschedule_with_priority, JobInfo, JobOptions, JobQueue, JobSignal, HIGHEST_PRIORITY,
};
pub use lock::{with_doc_lock, DocLock, LockAcquireResult, Locker};
pub use merge::{DocMerger, YrsMerger};
pub use metrics::{MetricsSink, NoopMetrics, PENDING_UPDATES_GAUGE};
pub use replica::DocReplica;
pub use scheduler::{
    MergeJob, MergeScheduler, SchedulerConfig, TickReport, MERGE_PENDING_UPDATES_JOB,
    RECORD_PENDING_COUNT_JOB, RECORD_PENDING_COUNT_JOB_ID,
};
pub use storage::{allocate_timestamp, initial_push_timestamp, DocStorage, MAX_PUSH_ATTEMPTS};
