use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use doc_storage_core::{
    allocate_timestamp, initial_push_timestamp, timestamp_from_millis, Broadcaster, DocClock,
    DocClocks, DocRecord, DocStorage, DocUpdate, PendingUpdates, StorageError, Subscription,
    Timestamp, UpdateCallback, UpdateNotifier,
};
use fs2::FileExt;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use super::validate_id;

const JOURNAL_FILE: &str = "updates.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";
const CLOCK_FILE: &str = "clock.json";
const WRITE_LOCK_FILE: &str = "write.lock";

/// Local filesystem storage backend.
///
/// Organizes data by workspace:
/// ```text
/// {base_dir}/
///   {space_id}/
///     write.lock
///     docs/
///       {doc_id}/
///         updates.jsonl
///         snapshot.json
///         clock.json
///     trash/
/// ```
///
/// Journals are append-only JSON lines; snapshots and clocks are replaced atomically
/// through a temp file. Every mutation holds an exclusive OS lock on `write.lock`, so
/// writers in other processes sharing the directory are serialized too. Deleting a
/// document moves its whole directory into `trash/` in one rename.
pub struct FileDocStorage {
    base_dir: PathBuf,
    space_id: String,
    write_lock: Arc<Mutex<()>>,
    notifier: UpdateNotifier,
}

/// Held for the duration of a mutation. Unlocks the workspace lock file on drop.
struct WriteGuard<'a> {
    file: std::fs::File,
    _local: MutexGuard<'a, ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock workspace write lock: {}", e);
        }
    }
}

impl FileDocStorage {
    pub fn new(
        base_dir: impl AsRef<Path>,
        space_id: impl Into<String>,
        write_lock: Arc<Mutex<()>>,
        channel: Option<Arc<dyn Broadcaster>>,
    ) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            space_id: space_id.into(),
            write_lock,
            notifier: UpdateNotifier::new(channel),
        }
    }

    fn space_dir(&self) -> PathBuf {
        self.base_dir.join(&self.space_id)
    }

    fn docs_dir(&self) -> PathBuf {
        self.space_dir().join("docs")
    }

    fn doc_dir(&self, doc_id: &str) -> PathBuf {
        self.docs_dir().join(doc_id)
    }

    fn journal_path(&self, doc_id: &str) -> PathBuf {
        self.doc_dir(doc_id).join(JOURNAL_FILE)
    }

    fn snapshot_path(&self, doc_id: &str) -> PathBuf {
        self.doc_dir(doc_id).join(SNAPSHOT_FILE)
    }

    fn clock_path(&self, doc_id: &str) -> PathBuf {
        self.doc_dir(doc_id).join(CLOCK_FILE)
    }

    async fn ensure_doc_dir(&self, doc_id: &str) -> Result<(), StorageError> {
        let dir = self.doc_dir(doc_id);
        fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::Io(format!("Failed to create doc dir {}: {}", dir.display(), e))
        })?;
        Ok(())
    }

    /// Take the in-process write lock, then the workspace lock file.
    async fn lock_workspace(&self) -> Result<WriteGuard<'_>, StorageError> {
        let local = self.write_lock.lock().await;
        let dir = self.space_dir();

        let file = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StorageError::Io(format!("Failed to create workspace dir {}: {}", dir.display(), e))
            })?;
            let path = dir.join(WRITE_LOCK_FILE);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| StorageError::Io(format!("Failed to open write lock: {}", e)))?;
            file.lock_exclusive()
                .map_err(|e| StorageError::Lock(format!("Failed to lock {}: {}", path.display(), e)))?;
            Ok::<_, StorageError>(file)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("Write lock task failed: {}", e)))??;

        Ok(WriteGuard {
            file,
            _local: local,
        })
    }

    // =========================================================================
    // Clocks
    // =========================================================================

    async fn clock_of(&self, doc_id: &str) -> Result<Option<Timestamp>, StorageError> {
        let path = self.clock_path(doc_id);
        match fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str::<i64>(&json)
                .map(|millis| Some(timestamp_from_millis(millis)))
                .map_err(|e| {
                    StorageError::Serialization(format!("Failed to parse clock of {}: {}", doc_id, e))
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read clock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Caller holds the write lock.
    async fn advance_clock(&self, doc_id: &str, timestamp: Timestamp) -> Result<(), StorageError> {
        let millis = match self.clock_of(doc_id).await? {
            Some(clock) if clock >= timestamp => return Ok(()),
            _ => timestamp.timestamp_millis(),
        };
        let json = serde_json::to_vec(&millis).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize clock: {}", e))
        })?;
        write_atomic(&self.clock_path(doc_id), &json).await
    }

    // =========================================================================
    // Journal
    // =========================================================================

    async fn read_journal(&self, doc_id: &str) -> Result<Vec<DocRecord>, StorageError> {
        let path = self.journal_path(doc_id);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to open journal {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Some(line) = lines.next_line().await.map_err(|e| {
            StorageError::Io(format!("Failed to read journal line: {}", e))
        })? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DocRecord>(&line) {
                Ok(record) => records.push(record),
                // A torn line from a crash mid-append.
                Err(e) => warn!("Skipping unreadable journal line of doc {}: {}", doc_id, e),
            }
        }

        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    /// Caller holds the write lock.
    async fn append_journal(&self, record: &DocRecord) -> Result<(), StorageError> {
        self.ensure_doc_dir(&record.doc_id).await?;
        let path = self.journal_path(&record.doc_id);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                StorageError::Io(format!("Failed to open journal {}: {}", path.display(), e))
            })?;

        // A crash can leave the last line without its newline; close it off so the
        // new record starts a line of its own.
        let mut line = Vec::new();
        if ends_torn(&mut file).await? {
            warn!("Terminating torn journal line of doc {}", record.doc_id);
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, record).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize journal entry: {}", e))
        })?;
        line.push(b'\n');

        file.write_all(&line)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to write journal: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to flush journal: {}", e)))?;
        Ok(())
    }

    /// Replace a journal with `records`, removing it when empty. Caller holds the
    /// write lock.
    async fn rewrite_journal(&self, doc_id: &str, records: &[DocRecord]) -> Result<(), StorageError> {
        let path = self.journal_path(doc_id);
        if records.is_empty() {
            return remove_if_exists(&path).await;
        }

        let mut content = Vec::new();
        for record in records {
            serde_json::to_writer(&mut content, record).map_err(|e| {
                StorageError::Serialization(format!("Failed to serialize journal entry: {}", e))
            })?;
            content.push(b'\n');
        }
        write_atomic(&path, &content).await
    }

    /// Append `record` unless its timestamp is not newer than the document clock.
    /// Caller holds the write lock.
    async fn insert_update(&self, record: DocRecord) -> Result<(), StorageError> {
        if self
            .clock_of(&record.doc_id)
            .await?
            .is_some_and(|clock| clock >= record.timestamp)
        {
            return Err(StorageError::Conflict(format!(
                "Doc {} already has an update at or after {}",
                record.doc_id,
                record.timestamp.timestamp_millis()
            )));
        }

        self.append_journal(&record).await?;
        self.advance_clock(&record.doc_id, record.timestamp).await
    }

    async fn count_journal(&self, doc_id: &str) -> Result<u64, StorageError> {
        Ok(self.read_journal(doc_id).await?.len() as u64)
    }

    /// Names of the document directories present in the workspace.
    async fn doc_ids(&self) -> Result<Vec<String>, StorageError> {
        let dir = self.docs_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read dir {}: {}",
                    dir.display(),
                    e
                )));
            }
        };

        let mut doc_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            StorageError::Io(format!("Failed to read dir entry: {}", e))
        })? {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| StorageError::Io(format!("Failed to stat dir entry: {}", e)))?
                .is_dir();
            if is_dir {
                doc_ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(doc_ids)
    }
}

/// Whether a non-empty journal lacks its trailing newline.
async fn ends_torn(file: &mut fs::File) -> Result<bool, StorageError> {
    let len = file
        .metadata()
        .await
        .map_err(|e| StorageError::Io(format!("Failed to stat journal: {}", e)))?
        .len();
    if len == 0 {
        return Ok(false);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))
        .await
        .map_err(|e| StorageError::Io(format!("Failed to seek journal: {}", e)))?;
    file.read_exact(&mut last)
        .await
        .map_err(|e| StorageError::Io(format!("Failed to read journal tail: {}", e)))?;
    Ok(last[0] != b'\n')
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&temp_path, data).await.map_err(|e| {
        StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
    })?;
    fs::rename(&temp_path, path).await.map_err(|e| {
        StorageError::Io(format!("Failed to rename to {}: {}", path.display(), e))
    })?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(format!(
            "Failed to delete {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait]
impl DocStorage for FileDocStorage {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    // =========================================================================
    // Update Log
    // =========================================================================

    #[instrument(skip(self, update), level = "debug", fields(doc_id = %update.doc_id, len = update.bin.len()))]
    async fn push_doc_update(
        &self,
        update: DocUpdate,
        origin: Option<&str>,
    ) -> Result<DocClock, StorageError> {
        validate_id("doc", &update.doc_id)?;
        let DocUpdate {
            doc_id,
            bin,
            editor,
        } = update;

        let timestamp = {
            let _guard = self.lock_workspace().await?;
            let initial = initial_push_timestamp(self.clock_of(&doc_id).await?);
            allocate_timestamp(&doc_id, initial, |candidate| {
                self.insert_update(DocRecord {
                    doc_id: doc_id.clone(),
                    bin: bin.clone(),
                    timestamp: candidate,
                    editor: editor.clone(),
                })
            })
            .await?
        };

        debug!("Appended update of doc {} at {}", doc_id, timestamp.timestamp_millis());
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

    #[instrument(skip(self), level = "debug")]
    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>, StorageError> {
        validate_id("doc", doc_id)?;
        self.read_journal(doc_id).await
    }

    #[instrument(skip(self, updates), level = "debug", fields(count = updates.len()))]
    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocRecord],
    ) -> Result<u64, StorageError> {
        validate_id("doc", doc_id)?;
        let _guard = self.lock_workspace().await?;

        let (merged, kept): (Vec<_>, Vec<_>) = self
            .read_journal(doc_id)
            .await?
            .into_iter()
            .partition(|r| updates.iter().any(|u| u.timestamp == r.timestamp));

        if merged.is_empty() {
            return Ok(0);
        }

        self.rewrite_journal(doc_id, &kept).await?;
        debug!(
            "Reaped {} merged updates of doc {}, {} left",
            merged.len(),
            doc_id,
            kept.len()
        );
        Ok(merged.len() as u64)
    }

    async fn get_update_count(&self, doc_id: &str) -> Result<u64, StorageError> {
        validate_id("doc", doc_id)?;
        self.count_journal(doc_id).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn pending_update_counts(&self) -> Result<Vec<PendingUpdates>, StorageError> {
        let mut pending = Vec::new();
        for doc_id in self.doc_ids().await? {
            let count = self.count_journal(&doc_id).await?;
            if count > 0 {
                pending.push(PendingUpdates {
                    space_id: self.space_id.clone(),
                    doc_id,
                    count,
                });
            }
        }
        Ok(pending)
    }

    // =========================================================================
    // Snapshot Store
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        validate_id("doc", doc_id)?;
        let path = self.snapshot_path(doc_id);
        match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).map(Some).map_err(|e| {
                StorageError::Serialization(format!("Failed to parse snapshot of {}: {}", doc_id, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, snapshot), level = "debug", fields(doc_id = %snapshot.doc_id, len = snapshot.bin.len()))]
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        validate_id("doc", &snapshot.doc_id)?;
        let _guard = self.lock_workspace().await?;

        if let Some(current) = self.get_doc_snapshot(&snapshot.doc_id).await? {
            if current.timestamp >= snapshot.timestamp {
                debug!(
                    "Keeping snapshot of doc {} at {}",
                    snapshot.doc_id,
                    current.timestamp.timestamp_millis()
                );
                return Ok(false);
            }
        }

        let data = serde_json::to_vec(snapshot).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize snapshot: {}", e))
        })?;
        self.ensure_doc_dir(&snapshot.doc_id).await?;
        write_atomic(&self.snapshot_path(&snapshot.doc_id), &data).await?;
        self.advance_clock(&snapshot.doc_id, snapshot.timestamp).await?;
        Ok(true)
    }

    // =========================================================================
    // Clock Table
    // =========================================================================

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>, StorageError> {
        validate_id("doc", doc_id)?;
        Ok(self.clock_of(doc_id).await?.map(|timestamp| DocClock {
            doc_id: doc_id.to_string(),
            timestamp,
        }))
    }

    async fn get_doc_timestamps(
        &self,
        after: Option<Timestamp>,
    ) -> Result<DocClocks, StorageError> {
        let mut clocks = DocClocks::new();
        for doc_id in self.doc_ids().await? {
            match self.clock_of(&doc_id).await? {
                Some(clock) if after.is_none_or(|after| clock > after) => {
                    clocks.insert(doc_id, clock);
                }
                _ => {}
            }
        }
        Ok(clocks)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        validate_id("doc", doc_id)?;
        let _guard = self.lock_workspace().await?;

        let doc_dir = self.doc_dir(doc_id);
        if !fs::try_exists(&doc_dir).await.map_err(|e| {
            StorageError::Io(format!("Failed to stat {}: {}", doc_dir.display(), e))
        })? {
            return Ok(());
        }

        // One rename takes updates, snapshot and clock out of view together.
        let trash = self.space_dir().join("trash");
        fs::create_dir_all(&trash).await.map_err(|e| {
            StorageError::Io(format!("Failed to create trash dir {}: {}", trash.display(), e))
        })?;
        let buried = trash.join(format!("{}.{}", doc_id, uuid::Uuid::new_v4().simple()));
        fs::rename(&doc_dir, &buried).await.map_err(|e| {
            StorageError::Io(format!("Failed to move {} to trash: {}", doc_dir.display(), e))
        })?;

        if let Err(e) = fs::remove_dir_all(&buried).await {
            warn!("Failed to purge deleted doc {}: {}", buried.display(), e);
        }
        debug!("Deleted doc {}", doc_id);
        Ok(())
    }

    fn subscribe_doc_update(&self, callback: UpdateCallback) -> Subscription {
        self.notifier.subscribe(callback)
    }
}
