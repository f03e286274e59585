use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use doc_storage_core::{CompactionConfig, SchedulerConfig};

use crate::engine::EngineOptions;
use crate::storage::BackendKind;

/// Configuration for the doc-storage-local merge service.
#[derive(Parser, Debug, Clone)]
#[command(name = "doc-storage-local")]
#[command(about = "Background merge service for local doc update logs")]
pub struct Config {
    /// Storage backend
    #[arg(long, value_enum, default_value = "file", env = "DOC_STORAGE_BACKEND")]
    pub backend: BackendKind,

    /// Base directory for sqlite and file storage, and for file locks
    #[arg(long, env = "DOC_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// PostgreSQL connection string (postgres backend only)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Workspaces to merge (comma separated). Defaults to every directory under the storage dir.
    #[arg(long, env = "DOC_WORKSPACES", value_delimiter = ',')]
    pub workspaces: Vec<String>,

    /// Pending update count above which a document is merged first
    #[arg(long, default_value = "100", env = "MERGE_THRESHOLD")]
    pub merge_threshold: u64,

    /// Seconds between backlog scans
    #[arg(long, default_value = "30", env = "MERGE_INTERVAL_SECS")]
    pub merge_interval_secs: u64,

    /// Fold at most this many updates per merge pass
    #[arg(long, env = "MERGE_BATCH_LIMIT")]
    pub merge_batch_limit: Option<usize>,

    /// TTL of the per-document lock held while merging
    #[arg(long, default_value = "60", env = "MERGE_LOCK_TTL_SECS")]
    pub merge_lock_ttl_secs: u64,

    /// Number of concurrent merge workers
    #[arg(long, default_value = "2", env = "MERGE_WORKERS")]
    pub merge_workers: usize,
}

impl Config {
    /// Get the effective storage directory.
    pub fn effective_storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("doc-storage")
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            backend: self.backend,
            base_dir: self.effective_storage_dir(),
            database_url: self.database_url.clone(),
            workspaces: self
                .workspaces
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            compaction: CompactionConfig {
                lock_ttl: Duration::from_secs(self.merge_lock_ttl_secs),
                batch_limit: self.merge_batch_limit,
            },
            scheduler: SchedulerConfig {
                threshold: self.merge_threshold,
                interval: Duration::from_secs(self.merge_interval_secs.max(1)),
                ..SchedulerConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["doc-storage-local", "--storage-dir", "/tmp/docs"]);
        let options = config.engine_options();

        assert_eq!(options.backend, BackendKind::File);
        assert_eq!(options.database_url, None);
        assert_eq!(options.base_dir, PathBuf::from("/tmp/docs"));
        assert!(options.workspaces.is_empty());
        assert_eq!(options.scheduler.threshold, 100);
        assert_eq!(options.scheduler.interval, Duration::from_secs(30));
        assert_eq!(options.compaction.lock_ttl, Duration::from_secs(60));
        assert_eq!(options.compaction.batch_limit, None);
        assert_eq!(config.merge_workers, 2);
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse_from([
            "doc-storage-local",
            "--backend",
            "sqlite",
            "--workspaces",
            "ws-a, ws-b,",
            "--merge-threshold",
            "10",
            "--merge-batch-limit",
            "50",
            "--database-url",
            "postgres://localhost/docs",
        ]);
        let options = config.engine_options();

        assert_eq!(options.backend, BackendKind::Sqlite);
        assert_eq!(options.workspaces, vec!["ws-a", "ws-b"]);
        assert_eq!(options.scheduler.threshold, 10);
        assert_eq!(options.compaction.batch_limit, Some(50));
        assert_eq!(options.database_url.as_deref(), Some("postgres://localhost/docs"));
    }
}
