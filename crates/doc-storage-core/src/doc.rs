use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical clock value of a document. Millisecond resolution.
pub type Timestamp = DateTime<Utc>;

/// Latest known timestamp per document, as returned by clock queries.
pub type DocClocks = HashMap<String, Timestamp>;

/// Build a timestamp from milliseconds since the Unix epoch.
pub fn timestamp_from_millis(millis: i64) -> Timestamp {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Current wall-clock time truncated to whole milliseconds.
pub fn now_timestamp() -> Timestamp {
    timestamp_from_millis(Utc::now().timestamp_millis())
}

/// The next timestamp after `ts`, one logical unit (1ms) later.
pub fn next_timestamp(ts: Timestamp) -> Timestamp {
    ts + chrono::Duration::milliseconds(1)
}

/// An incremental edit delta as handed in by an editor.
///
/// The timestamp is allocated by the storage on push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocUpdate {
    pub doc_id: String,
    #[serde(with = "serde_bytes")]
    pub bin: Vec<u8>,
    #[serde(default)]
    pub editor: Option<String>,
}

impl DocUpdate {
    pub fn new(doc_id: impl Into<String>, bin: impl Into<Vec<u8>>) -> Self {
        Self {
            doc_id: doc_id.into(),
            bin: bin.into(),
            editor: None,
        }
    }

    pub fn with_editor(mut self, editor: impl Into<String>) -> Self {
        self.editor = Some(editor.into());
        self
    }
}

/// A persisted update or a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub doc_id: String,
    #[serde(with = "serde_bytes")]
    pub bin: Vec<u8>,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub editor: Option<String>,
}

impl DocRecord {
    pub fn new(doc_id: impl Into<String>, bin: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            doc_id: doc_id.into(),
            bin: bin.into(),
            timestamp,
            editor: None,
        }
    }
}

/// `{doc_id, timestamp}` pair returned by `push_doc_update` and clock lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocClock {
    pub doc_id: String,
    pub timestamp: Timestamp,
}

/// Backlog of a single document, as aggregated for the merge scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdates {
    pub space_id: String,
    pub doc_id: String,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_truncated_to_millis() {
        let now = now_timestamp();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(timestamp_from_millis(now.timestamp_millis()), now);
    }

    #[test]
    fn test_next_timestamp_is_one_millisecond_later() {
        let ts = timestamp_from_millis(41);
        assert_eq!(next_timestamp(ts).timestamp_millis(), 42);
    }

    #[test]
    fn test_doc_record_json_shape() {
        let record = DocRecord::new("doc-1", vec![1u8, 2], timestamp_from_millis(5));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["doc_id"], "doc-1");
        assert_eq!(json["bin"], serde_json::json!([1, 2]));

        let back: DocRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
