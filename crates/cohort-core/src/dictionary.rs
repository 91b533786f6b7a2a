//! Bidirectional byte-sequence <-> integer mapping backing string columns.
//!
//! A dictionary grows only during import and is strictly read-only at query
//! time. Shared dictionaries are dataset-scoped and injected as `Arc`s into
//! the decode paths of string stores after storage load.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Id assigned to an entry, dense from zero in insertion order.
pub type DictId = u32;

/// Injective `bytes <-> u32` mapping for one string column or a shared pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dictionary {
    name: String,
    #[serde(skip)]
    value_to_id: HashMap<Vec<u8>, DictId>,
    id_to_value: Vec<Vec<u8>>,
}

impl Dictionary {
    /// Create an empty dictionary.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_to_id: HashMap::new(),
            id_to_value: Vec::new(),
        }
    }

    /// Dictionary name, unique within its dataset.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert `bytes`, failing if the value is already present.
    pub fn add(&mut self, bytes: &[u8]) -> Result<DictId> {
        if self.value_to_id.contains_key(bytes) {
            return Err(Error::dictionary(format!(
                "duplicate entry in {}: {:?}",
                self.name, bytes
            )));
        }
        Ok(self.insert(bytes))
    }

    /// Insert `bytes` or return the existing id.
    pub fn put(&mut self, bytes: &[u8]) -> DictId {
        if let Some(&id) = self.value_to_id.get(bytes) {
            return id;
        }
        self.insert(bytes)
    }

    fn insert(&mut self, bytes: &[u8]) -> DictId {
        let id = self.id_to_value.len() as DictId;
        self.value_to_id.insert(bytes.to_vec(), id);
        self.id_to_value.push(bytes.to_vec());
        id
    }

    /// Id of `bytes`, if present.
    pub fn id(&self, bytes: &[u8]) -> Option<DictId> {
        self.value_to_id.get(bytes).copied()
    }

    /// Value for `id`. Ids handed out by this dictionary are always valid.
    pub fn element(&self, id: DictId) -> Option<&[u8]> {
        self.id_to_value.get(id as usize).map(Vec::as_slice)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.id_to_value.len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.id_to_value.is_empty()
    }

    /// Iterate `(id, value)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (DictId, &[u8])> {
        self.id_to_value
            .iter()
            .enumerate()
            .map(|(id, value)| (id as DictId, value.as_slice()))
    }

    /// Rebuild the reverse map after deserialization.
    ///
    /// The forward map is not persisted; storage load calls this once before
    /// the dictionary is shared.
    pub fn rebuild_index(&mut self) {
        self.value_to_id = self
            .id_to_value
            .iter()
            .enumerate()
            .map(|(id, value)| (value.clone(), id as DictId))
            .collect();
    }

    /// Rough in-memory footprint in bytes, for diagnostics.
    pub fn estimate_memory_consumption(&self) -> u64 {
        let entry_overhead = 48u64 + (std::mem::size_of::<Vec<u8>>() as u64);
        let bytes: u64 = self.id_to_value.iter().map(|v| v.len() as u64).sum();
        self.id_to_value.len() as u64 * entry_overhead + 2 * bytes
    }
}
