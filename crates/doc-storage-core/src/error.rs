use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// The backend rejected a write because the `(doc_id, timestamp)` slot is taken
    /// or would break timestamp ordering.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Job queue error: {0}")]
    Queue(String),

    /// Every timestamp candidate collided; carries the last collision.
    #[error("Gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Whether the error is a uniqueness/ordering collision worth retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}
