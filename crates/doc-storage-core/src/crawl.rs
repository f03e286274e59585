//! Validation of structured content extracted from documents for indexing.
//!
//! Extractors are external and their output is untrusted: a result missing its basic
//! fields is discarded whole, malformed blocks are dropped one by one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::compaction::DocCompactor;
use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_id: String,
    pub flavour: String,
    pub content: Option<Vec<String>>,
    pub blob: Option<Vec<String>>,
    pub ref_doc_id: Option<Vec<String>>,
    pub ref_info: Option<Vec<String>>,
    pub parent_flavour: Option<String>,
    pub parent_block_id: Option<String>,
    /// Re-serialized JSON object.
    pub additional: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub blocks: Vec<BlockInfo>,
    pub title: String,
    pub summary: String,
}

/// Turns a merged document into raw structured content.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, doc_id: &str, bin: &[u8]) -> Result<Value, StorageError>;
}

/// Validate raw extractor output. `None` means the whole result was rejected.
pub fn normalize_crawl_result(raw: &Value) -> Option<CrawlResult> {
    let Some(result) = raw.as_object() else {
        warn!("Crawl result is not an object");
        return None;
    };

    let (Some(title), Some(summary), Some(raw_blocks)) = (
        read_field(result, "title").and_then(Value::as_str),
        read_field(result, "summary").and_then(Value::as_str),
        read_field(result, "blocks").and_then(Value::as_array),
    ) else {
        warn!("Crawl result missing basic fields");
        return None;
    };

    let blocks: Vec<BlockInfo> = raw_blocks.iter().filter_map(normalize_block).collect();
    if blocks.is_empty() {
        warn!("Crawl result has no valid blocks");
        return None;
    }

    Some(CrawlResult {
        blocks,
        title: title.to_string(),
        summary: summary.to_string(),
    })
}

fn normalize_block(block: &Value) -> Option<BlockInfo> {
    let block = block.as_object()?;
    let block_id = read_string(block, "blockId")?;
    let flavour = read_string(block, "flavour")?;

    Some(BlockInfo {
        block_id,
        flavour,
        content: read_string_list(block, "content"),
        blob: read_string_list(block, "blob"),
        ref_doc_id: read_string_list(block, "refDocId"),
        ref_info: read_string_list(block, "refInfo"),
        parent_flavour: read_string(block, "parentFlavour"),
        parent_block_id: read_string(block, "parentBlockId"),
        additional: read_additional(block),
    })
}

/// Look a field up by its camelCase name, falling back to snake_case.
fn read_field<'a>(target: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    target
        .get(key)
        .filter(|v| !v.is_null())
        .or_else(|| target.get(&to_snake_case(key)))
}

fn read_string(target: &Map<String, Value>, key: &str) -> Option<String> {
    read_field(target, key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn read_string_list(target: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    match read_field(target, key)? {
        Value::Array(items) => {
            let items: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            (!items.is_empty()).then_some(items)
        }
        Value::String(s) if !s.is_empty() => Some(vec![s.clone()]),
        _ => None,
    }
}

fn read_additional(target: &Map<String, Value>) -> Option<String> {
    let raw = read_string(target, "additional")?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(parsed) => Some(parsed.to_string()),
        Err(_) => {
            warn!("Ignoring invalid additional payload in crawled block");
            None
        }
    }
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Produces validated index content for documents.
pub struct DocCrawler {
    compactor: Arc<DocCompactor>,
    extractor: Arc<dyn ContentExtractor>,
}

impl DocCrawler {
    pub fn new(compactor: Arc<DocCompactor>, extractor: Arc<dyn ContentExtractor>) -> Self {
        Self {
            compactor,
            extractor,
        }
    }

    /// Extract and validate the content of a document. Extractor failures and invalid
    /// output yield `None`; only storage errors are returned as errors.
    pub async fn crawl_doc_data(&self, doc_id: &str) -> Result<Option<CrawlResult>, StorageError> {
        let Some(doc) = self.compactor.get_doc(doc_id).await? else {
            return Ok(None);
        };

        match self.extractor.extract(doc_id, &doc.bin) {
            Ok(raw) => Ok(normalize_crawl_result(&raw)),
            Err(e) => {
                warn!("Failed to extract content of doc {}: {}", doc_id, e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_valid_result_is_normalized() {
        let raw = json!({
            "title": "Plan",
            "summary": "Q3",
            "blocks": [{
                "blockId": "b1",
                "flavour": "affine:paragraph",
                "content": ["hello", "", 3],
                "ref_doc_id": "doc-2",
                "additional": "{ \"displayMode\": \"page\" }"
            }]
        });

        let result = normalize_crawl_result(&raw).unwrap();
        assert_eq!(result.title, "Plan");
        let block = &result.blocks[0];
        assert_eq!(block.block_id, "b1");
        assert_eq!(block.content, Some(vec!["hello".to_string()]));
        assert_eq!(block.ref_doc_id, Some(vec!["doc-2".to_string()]));
        assert_eq!(block.additional.as_deref(), Some(r#"{"displayMode":"page"}"#));
        assert_eq!(block.blob, None);
    }

    #[test]
    fn test_missing_basic_fields_discards_everything() {
        let raw = json!({
            "title": "Plan",
            "blocks": [{"blockId": "b1", "flavour": "affine:paragraph"}]
        });
        assert!(normalize_crawl_result(&raw).is_none());
        assert!(normalize_crawl_result(&json!(["not", "an", "object"])).is_none());
    }

    #[test]
    fn test_invalid_blocks_are_dropped() {
        let raw = json!({
            "title": "t",
            "summary": "s",
            "blocks": [
                {"blockId": "", "flavour": "x"},
                {"flavour": "x"},
                "garbage",
                {"block_id": "b2", "flavour": "x", "additional": "{not json"}
            ]
        });

        let result = normalize_crawl_result(&raw).unwrap();
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].block_id, "b2");
        assert_eq!(result.blocks[0].additional, None);
    }

    #[test]
    fn test_no_valid_blocks_discards_result() {
        let raw = json!({"title": "t", "summary": "s", "blocks": [{"flavour": "x"}]});
        assert!(normalize_crawl_result(&raw).is_none());
    }

    #[test]
    fn test_snake_case_conversion() {
        assert_eq!(to_snake_case("parentBlockId"), "parent_block_id");
        assert_eq!(to_snake_case("title"), "title");
    }
}
