//! Memory backend
//!
//! BTreeMap-based entry map with RwLock for concurrency.
//! Always available, never persisted, no quota.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::entry::StoredEntry;
use crate::error::Result;

use super::{BackendAdapter, Usage};

/// In-memory fallback medium
pub struct MemoryStore {
    /// Entries keyed by physical key, each with its encoded size
    data: RwLock<BTreeMap<String, (StoredEntry, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of entries held
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendAdapter for MemoryStore {
    fn store(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let size = key.len() as u64 + entry.encoded_len();
        self.data.write().insert(key.to_string(), (entry.clone(), size));
        Ok(())
    }

    fn fetch(&self, key: &str) -> Result<Option<StoredEntry>> {
        Ok(self.data.read().get(key).map(|(entry, _)| entry.clone()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }

    fn measure_usage(&self) -> Result<Usage> {
        let data = self.data.read();
        Ok(Usage {
            items: data.len() as u64,
            bytes: data.values().map(|(_, size)| size).sum(),
        })
    }
}
