use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use doc_storage_core::{
    CompactionConfig, DocCompactor, DocMerger, Locker, MergeScheduler, MetricsSink,
    SchedulerConfig, StorageError, YrsMerger,
};
use tracing::{info, warn};

use crate::lock::{FileLock, MemoryLocker, PgLocker};
use crate::queue::MemoryJobQueue;
use crate::storage::{BackendKind, StorageFactory};
use crate::worker::MergeWorker;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub backend: BackendKind,
    pub base_dir: std::path::PathBuf,
    /// Connection string of the postgres backend.
    pub database_url: Option<String>,
    /// Workspaces to serve; discovered from `base_dir` when empty.
    pub workspaces: Vec<String>,
    pub compaction: CompactionConfig,
    pub scheduler: SchedulerConfig,
}

/// The wired-up storage stack: one compactor per workspace, the merge scheduler and
/// its job queue.
pub struct Engine {
    factory: StorageFactory,
    compactors: HashMap<String, Arc<DocCompactor>>,
    scheduler: Arc<MergeScheduler>,
    queue: Arc<MemoryJobQueue>,
}

impl Engine {
    pub fn open(
        options: EngineOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, StorageError> {
        let mut factory = StorageFactory::new(options.backend, &options.base_dir);
        if let Some(url) = &options.database_url {
            factory = factory.with_database_url(url)?;
        }

        // Locks live next to the data they guard.
        let locker: Arc<dyn Locker> = match (options.backend, factory.postgres_pool()) {
            (BackendKind::Memory, _) => Arc::new(MemoryLocker::new()),
            (BackendKind::Sqlite | BackendKind::File, _) => {
                Arc::new(FileLock::new(&options.base_dir))
            }
            (BackendKind::Postgres, Some(pool)) => Arc::new(PgLocker::new(pool.clone())),
            (BackendKind::Postgres, None) => {
                return Err(StorageError::InvalidArgument(
                    "The postgres backend needs a database URL".to_string(),
                ));
            }
        };
        let merger: Arc<dyn DocMerger> = Arc::new(YrsMerger);

        let mut workspaces = options.workspaces;
        if workspaces.is_empty()
            && matches!(options.backend, BackendKind::Sqlite | BackendKind::File)
        {
            workspaces = discover_workspaces(&options.base_dir)?;
        }
        if workspaces.is_empty() {
            warn!("No workspaces configured, the scheduler has nothing to merge");
        }

        let queue = Arc::new(MemoryJobQueue::new());
        let mut scheduler = MergeScheduler::new(queue.clone(), metrics, options.scheduler);
        let mut compactors = HashMap::new();

        for space_id in workspaces {
            let storage = factory.open(&space_id)?;
            let compactor = Arc::new(DocCompactor::new(
                storage,
                locker.clone(),
                merger.clone(),
                options.compaction.clone(),
            ));
            scheduler.add_space(compactor.clone());
            compactors.insert(space_id, compactor);
        }

        info!(
            "Engine ready: {} backend, {} workspaces, {} lock",
            options.backend,
            compactors.len(),
            locker.lock_type()
        );

        Ok(Self {
            factory,
            compactors,
            scheduler: Arc::new(scheduler),
            queue,
        })
    }

    pub fn factory(&self) -> &StorageFactory {
        &self.factory
    }

    #[cfg(test)]
    pub fn compactor(&self, space_id: &str) -> Option<&Arc<DocCompactor>> {
        self.compactors.get(space_id)
    }

    pub fn workspaces(&self) -> impl Iterator<Item = &str> {
        self.compactors.keys().map(String::as_str)
    }

    pub fn worker(&self, concurrency: usize) -> MergeWorker {
        MergeWorker::new(self.scheduler.clone(), self.queue.clone(), concurrency)
    }
}

/// Workspace ids are the directory names under the storage root.
fn discover_workspaces(base_dir: &Path) -> Result<Vec<String>, StorageError> {
    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                base_dir.display(),
                e
            )));
        }
    };

    let mut workspaces = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::Io(format!("Failed to read dir entry: {}", e)))?;
        if entry.path().is_dir() {
            workspaces.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    workspaces.sort();
    Ok(workspaces)
}
