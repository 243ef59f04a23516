//! # Mutations and Mutation Batches
//!
//! A [`Mutation`] is one write against one document. A [`MutationBatch`] is an
//! ordered, non-empty group of mutations created and acknowledged as a unit.
//! Batches are immutable once built; the set of keys they touch is computed
//! exactly once, at construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{BatchId, DocumentKey, DocumentKeySet, Timestamp};

// =============================================================================
// Mutation
// =============================================================================

/// A single write operation targeting exactly one document.
///
/// Document bodies are opaque JSON values; the queue never looks inside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Replace the whole document.
    Set { key: DocumentKey, value: Value },

    /// Update only the fields named in `field_mask` (dotted field paths).
    Patch {
        key: DocumentKey,
        value: Value,
        field_mask: Vec<String>,
    },

    /// Delete the document.
    Delete { key: DocumentKey },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: Value) -> Self {
        Mutation::Set { key, value }
    }

    pub fn patch(key: DocumentKey, value: Value, field_mask: Vec<String>) -> Self {
        Mutation::Patch {
            key,
            value,
            field_mask,
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete { key }
    }

    /// The document this mutation writes.
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. } | Mutation::Patch { key, .. } | Mutation::Delete { key } => {
                key
            }
        }
    }
}

// =============================================================================
// MutationBatch
// =============================================================================

/// An immutable, ordered group of mutations with its queue-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationBatch {
    batch_id: BatchId,
    local_write_time: Timestamp,
    mutations: Vec<Mutation>,
    keys: DocumentKeySet,
}

impl MutationBatch {
    /// Builds a batch, deriving its key set.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyBatch`] if `mutations` is empty.
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> Result<Self> {
        if mutations.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let keys = mutations.iter().map(|m| m.key().clone()).collect();
        Ok(Self {
            batch_id,
            local_write_time,
            mutations,
            keys,
        })
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    /// Mutations in application order.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Every document key touched by this batch.
    pub fn keys(&self) -> &DocumentKeySet {
        &self.keys
    }

    pub fn affects_key(&self, key: &DocumentKey) -> bool {
        self.keys.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    #[test]
    fn test_batch_keys_are_derived_and_deduplicated() {
        let batch = MutationBatch::new(
            BatchId::FIRST,
            Timestamp::from_millis(10),
            vec![
                Mutation::set(key("rooms/b"), json!({"n": 1})),
                Mutation::patch(key("rooms/a"), json!({"n": 2}), vec!["n".into()]),
                Mutation::delete(key("rooms/b")),
            ],
        )
        .unwrap();

        let keys: Vec<String> = batch.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["rooms/a", "rooms/b"]);
        assert_eq!(batch.mutations().len(), 3);
        assert!(matches!(batch.mutations()[2], Mutation::Delete { .. }));
        assert!(batch.affects_key(&key("rooms/a")));
        assert!(!batch.affects_key(&key("rooms/c")));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let result = MutationBatch::new(BatchId::FIRST, Timestamp::from_millis(0), vec![]);
        assert!(matches!(result, Err(Error::EmptyBatch)));
    }

    #[test]
    fn test_mutation_serde_shape() {
        let m = Mutation::delete(key("rooms/a"));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json, json!({"op": "delete", "key": "rooms/a"}));
    }
}
