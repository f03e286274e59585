use doc_storage_core::{MetricsSink, StorageError};
use tracing::info;

/// Reports measurements as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn gauge(&self, name: &str, value: f64) -> Result<(), StorageError> {
        info!(metric = name, value, "gauge");
        Ok(())
    }
}
