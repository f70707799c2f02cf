//! Local key/value storage.
//!
//! Values are indexed by the SHA-1 digest of their key, the same
//! identifier used for routing. The store keeps the original key bytes
//! alongside the value so entries can be re-published verbatim. Writes are
//! last-write-wins; nothing expires.

use std::collections::HashMap;

use lodestone_types::id::NodeId;

/// A stored entry: the original key bytes and the value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredValue {
    /// The application-level key.
    pub key: Vec<u8>,
    /// The stored value.
    pub value: Vec<u8>,
}

/// In-memory value store, keyed by `SHA-1(key)`.
#[derive(Debug, Default)]
pub struct ValueStore {
    entries: HashMap<NodeId, StoredValue>,
}

impl ValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key/value pair, replacing any previous value for the key.
    ///
    /// Returns the routing identifier the entry is stored under.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> NodeId {
        let id = NodeId::for_key(&key);
        self.entries.insert(id, StoredValue { key, value });
        id
    }

    /// Look up an entry by its routing identifier.
    pub fn get(&self, id: &NodeId) -> Option<&StoredValue> {
        self.entries.get(id)
    }

    /// Whether an entry exists for this routing identifier.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
