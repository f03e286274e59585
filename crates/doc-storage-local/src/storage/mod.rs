mod file;
mod memory;
mod postgres;
mod sqlite;

#[cfg(test)]
pub(crate) mod contract;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use doc_storage_core::{Broadcaster, DocStorage, LocalChannel, StorageError};
use sqlx::postgres::PgPool;
use tokio::sync::Mutex;
use tracing::info;

pub use file::FileDocStorage;
pub use memory::{MemoryDocStorage, MemoryRoot};
pub use postgres::{connect_pool, PostgresDocStorage};
pub(crate) use postgres::{pg_error, Schema};
pub use sqlite::SqliteDocStorage;

#[cfg(test)]
pub(crate) use postgres::test_database_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Memory,
    Sqlite,
    File,
    Postgres,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::File => write!(f, "file"),
            BackendKind::Postgres => write!(f, "postgres"),
        }
    }
}

/// Opens `DocStorage` instances for one storage root.
///
/// Instances opened on the same workspace share a broadcast channel, so an update
/// pushed through one is delivered to the subscribers of the others. Memory instances
/// also share their tables; file instances share their write lock; postgres
/// instances share one connection pool.
pub struct StorageFactory {
    backend: BackendKind,
    base_dir: PathBuf,
    memory: MemoryRoot,
    postgres: Option<PgPool>,
    channels: DashMap<String, LocalChannel>,
    file_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StorageFactory {
    pub fn new(backend: BackendKind, base_dir: impl AsRef<Path>) -> Self {
        Self {
            backend,
            base_dir: base_dir.as_ref().to_path_buf(),
            memory: MemoryRoot::default(),
            postgres: None,
            channels: DashMap::new(),
            file_locks: DashMap::new(),
        }
    }

    /// Connect the postgres backend to `database_url`. Connections open on first use.
    pub fn with_database_url(mut self, database_url: &str) -> Result<Self, StorageError> {
        self.postgres = Some(connect_pool(database_url)?);
        Ok(self)
    }

    /// Pool of the postgres backend, once configured.
    pub fn postgres_pool(&self) -> Option<&PgPool> {
        self.postgres.as_ref()
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Open a storage instance serving `space_id`.
    pub fn open(&self, space_id: &str) -> Result<Arc<dyn DocStorage>, StorageError> {
        validate_id("space", space_id)?;
        let channel = self.channel(space_id);

        let storage: Arc<dyn DocStorage> = match self.backend {
            BackendKind::Memory => Arc::new(MemoryDocStorage::open(
                &self.memory,
                space_id,
                Some(channel),
            )),
            BackendKind::Sqlite => Arc::new(SqliteDocStorage::open(
                &self.base_dir,
                space_id,
                Some(channel),
            )?),
            BackendKind::File => {
                let write_lock = self
                    .file_locks
                    .entry(space_id.to_string())
                    .or_default()
                    .clone();
                Arc::new(FileDocStorage::new(
                    &self.base_dir,
                    space_id,
                    write_lock,
                    Some(channel),
                ))
            }
            BackendKind::Postgres => {
                let pool = self.postgres.clone().ok_or_else(|| {
                    StorageError::InvalidArgument(
                        "The postgres backend needs a database URL".to_string(),
                    )
                })?;
                Arc::new(PostgresDocStorage::new(pool, space_id, Some(channel)))
            }
        };

        info!(
            "Opened {} storage for workspace {}",
            storage.backend_name(),
            space_id
        );
        Ok(storage)
    }

    /// Channel shared by every instance opened on `space_id`.
    pub fn channel(&self, space_id: &str) -> Arc<dyn Broadcaster> {
        let channel = self
            .channels
            .entry(space_id.to_string())
            .or_default()
            .clone();
        Arc::new(channel)
    }
}

/// Ids end up in file names, so path separators and relative components are refused.
pub(crate) fn validate_id(kind: &str, id: &str) -> Result<(), StorageError> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidArgument(format!(
            "Invalid {} id: {:?}",
            kind, id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc_storage_core::DocUpdate;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("doc", "page-1").is_ok());
        assert!(validate_id("doc", "").is_err());
        assert!(validate_id("doc", "..").is_err());
        assert!(validate_id("doc", "a/b").is_err());
    }

    #[test]
    fn test_postgres_requires_database_url() {
        let factory = StorageFactory::new(BackendKind::Postgres, "unused");
        assert!(matches!(
            factory.open("ws"),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_instances_share_channel_per_workspace() {
        for backend in [BackendKind::Memory, BackendKind::Sqlite, BackendKind::File] {
            let temp = TempDir::new().unwrap();
            let factory = StorageFactory::new(backend, temp.path());
            let writer = factory.open("ws").unwrap();
            let reader = factory.open("ws").unwrap();
            let other_space = factory.open("ws-2").unwrap();

            let seen = Arc::new(AtomicU64::new(0));
            let seen_by_reader = seen.clone();
            let _sub = reader.subscribe_doc_update(Arc::new(move |_| {
                seen_by_reader.fetch_add(1, Ordering::SeqCst);
            }));
            let foreign = Arc::new(AtomicU64::new(0));
            let foreign_seen = foreign.clone();
            let _other = other_space.subscribe_doc_update(Arc::new(move |_| {
                foreign_seen.fetch_add(1, Ordering::SeqCst);
            }));

            writer
                .push_doc_update(DocUpdate::new("doc", vec![1]), Some("tabA"))
                .await
                .unwrap();

            for _ in 0..100 {
                if seen.load(Ordering::SeqCst) == 1 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            assert_eq!(seen.load(Ordering::SeqCst), 1, "backend {}", backend);
            assert_eq!(foreign.load(Ordering::SeqCst), 0, "backend {}", backend);
        }
    }
}
