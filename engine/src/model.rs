//! Core data model: composite keys, chunk identifiers, and the three in-memory
//! indexes the engine keeps consistent (KeyIndex, ReverseIndex, ResidentMap).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Identifier of a persistence chunk. Opaque; only FS allocates and names these.
pub type ChunkId = String;

/// A two-part composite key. Hashed as a pair, per the original's `(row, col)`
/// set membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub row: String,
    pub col: String,
}

impl Key {
    pub fn new(row: impl Into<String>, col: impl Into<String>) -> Self {
        Key {
            row: row.into(),
            col: col.into(),
        }
    }
}

/// Persistent mapping: key -> owning chunk-id. Authoritative; rebuilt from disk
/// at startup, snapshotted on flush.
pub type KeyIndex = HashMap<Key, ChunkId>;

/// In-memory inversion of KeyIndex, used to enumerate a chunk's keys during
/// flush/eviction. Derived; must stay a mutual inverse of KeyIndex.
pub type ReverseIndex = HashMap<ChunkId, HashSet<Key>>;

/// In-memory cache of resident chunk contents: row -> (col -> value).
pub type ResidentMap = HashMap<String, HashMap<String, String>>;

pub fn resident_get<'a>(map: &'a ResidentMap, key: &Key) -> Option<&'a String> {
    map.get(&key.row).and_then(|cols| cols.get(&key.col))
}

pub fn resident_put(map: &mut ResidentMap, key: &Key, value: String) {
    map.entry(key.row.clone())
        .or_default()
        .insert(key.col.clone(), value);
}

pub fn resident_remove(map: &mut ResidentMap, key: &Key) {
    if let Some(cols) = map.get_mut(&key.row) {
        cols.remove(&key.col);
        if cols.is_empty() {
            map.remove(&key.row);
        }
    }
}

/// Invert a freshly loaded KeyIndex into its ReverseIndex, per recovery step 1.
pub fn invert(index: &KeyIndex) -> ReverseIndex {
    let mut reverse: ReverseIndex = HashMap::new();
    for (key, chunk_id) in index {
        reverse
            .entry(chunk_id.clone())
            .or_default()
            .insert(key.clone());
    }
    reverse
}
