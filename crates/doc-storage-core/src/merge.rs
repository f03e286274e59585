use crate::error::StorageError;

/// Opaque CRDT merge function.
///
/// Must be associative and commutative with respect to causal order; the storage
/// layer feeds it the snapshot followed by pending updates in timestamp order.
pub trait DocMerger: Send + Sync {
    fn merge(&self, updates: &[&[u8]]) -> Result<Vec<u8>, StorageError>;
}

/// Merges lib0 v1 encoded Yjs updates with `yrs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct YrsMerger;

impl DocMerger for YrsMerger {
    fn merge(&self, updates: &[&[u8]]) -> Result<Vec<u8>, StorageError> {
        match updates {
            [] => Err(StorageError::InvalidArgument(
                "nothing to merge".to_string(),
            )),
            [single] => Ok(single.to_vec()),
            _ => yrs::merge_updates_v1(updates).map_err(|e| {
                StorageError::Merge(format!("Failed to merge {} updates: {}", updates.len(), e))
            }),
        }
    }
}
