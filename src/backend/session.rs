//! Session backend
//!
//! A string-typed key/value medium scoped to the lifetime of the engine.
//! Entries are held as JSON text and counted against a quota the way a
//! browser counts characters of session storage.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::entry::StoredEntry;
use crate::error::Result;

use super::{check_quota, BackendAdapter, BackendKind, Usage};

/// Process-scoped string store
pub struct SessionStore {
    data: RwLock<SessionData>,
    quota: Option<u64>,
}

#[derive(Default)]
struct SessionData {
    items: HashMap<String, String>,
    /// Sum of key and value lengths
    bytes: u64,
}

fn footprint(key: &str, text: &str) -> u64 {
    (key.len() + text.len()) as u64
}

impl SessionStore {
    pub fn new(quota: Option<u64>) -> Self {
        Self {
            data: RwLock::new(SessionData::default()),
            quota,
        }
    }
}

impl BackendAdapter for SessionStore {
    fn store(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let text = entry.to_json()?;
        let incoming = footprint(key, &text);

        let mut data = self.data.write();
        let replaced = data
            .items
            .get(key)
            .map(|old| footprint(key, old))
            .unwrap_or(0);
        check_quota(BackendKind::Session, self.quota, data.bytes, replaced, incoming)?;

        data.bytes = data.bytes - replaced + incoming;
        data.items.insert(key.to_string(), text);
        Ok(())
    }

    fn fetch(&self, key: &str) -> Result<Option<StoredEntry>> {
        let data = self.data.read();
        match data.items.get(key) {
            Some(text) => Ok(Some(StoredEntry::from_json(text)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut data = self.data.write();
        if let Some(old) = data.items.remove(key) {
            data.bytes -= footprint(key, &old);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut data = self.data.write();
        data.items.clear();
        data.bytes = 0;
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().items.keys().cloned().collect())
    }

    fn measure_usage(&self) -> Result<Usage> {
        let data = self.data.read();
        Ok(Usage {
            items: data.items.len() as u64,
            bytes: data.bytes,
        })
    }
}
