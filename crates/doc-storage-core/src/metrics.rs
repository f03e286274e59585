use crate::error::StorageError;

/// Gauge of the aggregate pending-update backlog.
pub const PENDING_UPDATES_GAUGE: &str = "doc.pending_updates";

/// Observability collaborator. Callers log and ignore errors; emission never blocks
/// the write or compaction path.
pub trait MetricsSink: Send + Sync {
    fn gauge(&self, name: &str, value: f64) -> Result<(), StorageError>;
}

/// Discards every measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn gauge(&self, _name: &str, _value: f64) -> Result<(), StorageError> {
        Ok(())
    }
}
