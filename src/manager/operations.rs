//! Core read/write algorithms of the storage manager

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use serde_json::Value;

use crate::backend::{BackendDescriptor, BackendKind};
use crate::entry::{now_millis, type_of, EntryMetadata, StoredEntry};
use crate::error::{Result, StashError};
use crate::events::StorageEvent;

use super::{CachedEntry, GetOptions, SetOptions, StorageManager};

impl StorageManager {
    // =========================================================================
    // Backend Selection
    // =========================================================================

    /// Pick the backend for an entry of `size` bytes
    ///
    /// 1. A registered, available `preferred` backend wins
    /// 2. Large entries go to the transactional backend when it is available
    /// 3. Otherwise the first available of durable → session → memory
    pub fn select_backend(&self, size: usize, preferred: Option<BackendKind>) -> Result<BackendKind> {
        let available = |kind: BackendKind| self.backend(kind).is_some();

        if let Some(kind) = preferred {
            if available(kind) {
                return Ok(kind);
            }
            tracing::debug!("Preferred backend {} unavailable, selecting another", kind);
        }

        if size > self.config.large_value_threshold && available(BackendKind::Transactional) {
            return Ok(BackendKind::Transactional);
        }

        BackendKind::WRITE_ORDER
            .iter()
            .copied()
            .find(|&kind| available(kind))
            .ok_or(StashError::NoBackendAvailable)
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Get a value by key
    ///
    /// Returns `Ok(None)` when no backend holds the key.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.get_with(key, &GetOptions::default())
    }

    /// Get a value by key
    ///
    /// Search order:
    /// 1. Cache (unless `skip_cache`)
    /// 2. Backends in lookup order, first hit wins
    ///
    /// A backend that fails, or holds an entry that cannot be decoded, is
    /// logged and skipped.
    pub fn get_with(&self, key: &str, options: &GetOptions) -> Result<Option<Value>> {
        Self::validate_key(key)?;

        match self.lookup(key, options.skip_cache) {
            Some((value, Some(backend))) => {
                self.events.emit(StorageEvent::Get {
                    key: key.to_string(),
                    backend,
                });
                Ok(Some(value))
            }
            Some((value, None)) => Ok(Some(value)),
            None => Ok(options.default.clone()),
        }
    }

    /// Resolve a key without emitting events
    ///
    /// The backend is `None` when the value came from the cache.
    fn lookup(&self, key: &str, skip_cache: bool) -> Option<(Value, Option<BackendKind>)> {
        if !skip_cache {
            if let Some(cached) = self.cache.write().get_mut(key) {
                cached.metadata.accessed = now_millis();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache hit for {}", key);
                return Some((cached.value.clone(), None));
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Cache miss for {}", key);

        let generation = self.key_locks.generation(key);

        let physical = self.physical(key);
        for descriptor in &self.registry {
            let Some(backend) = descriptor.handle() else {
                continue;
            };

            let entry = match backend.fetch(&physical) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Lookup of {} in {} failed: {}", key, descriptor.kind, e);
                    continue;
                }
            };

            let value = match self.decode(&entry) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Entry {} in {} cannot be decoded: {}", key, descriptor.kind, e);
                    continue;
                }
            };

            let value = self.populate_cache(key, value, entry, descriptor.kind, generation);
            return Some((value, Some(descriptor.kind)));
        }

        None
    }

    /// Insert a value read from a backend, unless a write or remove of the
    /// key happened since `generation` was sampled, or the cached value is
    /// still awaiting persistence; returns the value now current for the key.
    fn populate_cache(
        &self,
        key: &str,
        value: Value,
        entry: StoredEntry,
        kind: BackendKind,
        generation: u64,
    ) -> Value {
        let is_dirty = self.dirty.lock().contains(key);
        let mut cache = self.cache.write();

        if is_dirty || self.key_locks.generation(key) != generation {
            tracing::debug!("Not caching stale read of {} from {}", key, kind);
            return match cache.get(key) {
                Some(newer) => newer.value.clone(),
                None => value,
            };
        }

        let mut metadata = entry.metadata;
        metadata.accessed = now_millis();
        cache.insert(
            key.to_string(),
            CachedEntry {
                value: value.clone(),
                value_type: entry.value_type,
                metadata,
                backend: Some(kind),
                preferred: None,
                skip_encryption: !entry.encrypted,
            },
        );
        value
    }

    /// True when some backend (or the cache) holds the key
    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    // =========================================================================
    // Set
    // =========================================================================

    /// Store a value
    ///
    /// Steps:
    /// 1. Validate the key
    /// 2. Build the entry (compress, then encrypt)
    /// 3. Write the cache and mark the key dirty
    /// 4. Persist to the selected backend
    ///
    /// If step 4 fails the error is returned but the cache keeps the new
    /// value: reads stay consistent with the last call, while durability
    /// is retried by the next sync.
    pub fn set(&self, key: &str, value: Value, options: SetOptions) -> Result<()> {
        Self::validate_key(key)?;

        let outcome = {
            let _guard = self.key_locks.lock(key);
            self.write_locked(key, value, options)
        };
        self.finish_write(key, outcome)
    }

    /// Read-modify-write a key atomically with respect to other writers
    ///
    /// `f` receives the current value (if any) and returns the new one.
    pub fn update<F>(&self, key: &str, f: F) -> Result<Value>
    where
        F: FnOnce(Option<Value>) -> Result<Value>,
    {
        let mut written = Value::Null;
        self.update_if(key, |current| {
            let value = f(current)?;
            written = value.clone();
            Ok(Some(value))
        })?;
        Ok(written)
    }

    /// Like [`update`](Self::update), but `f` may return `None` to leave
    /// the key untouched; returns whether a value was written
    pub fn update_if<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(Option<Value>) -> Result<Option<Value>>,
    {
        Self::validate_key(key)?;

        let outcome = {
            let _guard = self.key_locks.lock(key);
            let current = self.lookup(key, false).map(|(value, _)| value);
            match f(current)? {
                Some(value) => self.write_locked(key, value, SetOptions::default()),
                None => return Ok(false),
            }
        };
        self.finish_write(key, outcome)?;
        Ok(true)
    }

    /// Steps 2-4 of `set`; the caller holds the key lock
    fn write_locked(&self, key: &str, value: Value, options: SetOptions) -> Result<BackendKind> {
        let now = now_millis();
        let created = self
            .cache
            .read()
            .get(key)
            .map(|cached| cached.metadata.created)
            .unwrap_or(now);

        let metadata = EntryMetadata {
            created,
            modified: now,
            accessed: now,
            schema_version: self.stored_schema_version().to_string(),
            extra: options.metadata,
        };
        let value_type = options
            .value_type
            .unwrap_or_else(|| type_of(&value).to_string());

        let entry = self.encode(
            self.physical(key),
            &value,
            value_type.clone(),
            metadata.clone(),
            options.skip_encryption,
        )?;

        {
            let mut cache = self.cache.write();
            self.key_locks.bump(key);
            cache.insert(
                key.to_string(),
                CachedEntry {
                    value,
                    value_type,
                    metadata,
                    backend: None,
                    preferred: options.backend,
                    skip_encryption: options.skip_encryption,
                },
            );
        }
        self.dirty.lock().insert(key.to_string());

        let kind = self.persist(key, &entry, options.backend)?;
        if let Some(cached) = self.cache.write().get_mut(key) {
            cached.backend = Some(kind);
        }
        Ok(kind)
    }

    /// Emit the events of a finished write (called with no locks held)
    fn finish_write(&self, key: &str, outcome: Result<BackendKind>) -> Result<()> {
        match outcome {
            Ok(backend) => {
                self.events.emit(StorageEvent::Set {
                    key: key.to_string(),
                    backend,
                });
                Ok(())
            }
            Err(e) => {
                if let StashError::QuotaExceeded { backend, needed, quota } = &e {
                    self.events.emit(StorageEvent::QuotaExceeded {
                        backend: *backend,
                        key: key.to_string(),
                        needed: *needed,
                        quota: *quota,
                    });
                }
                Err(e)
            }
        }
    }

    /// Write an encoded entry to its backend
    ///
    /// A timeout falls through to the next backend in write order. On
    /// success the key leaves the dirty set and stale copies in other
    /// backends are removed, so each key lives in exactly one backend.
    pub(crate) fn persist(
        &self,
        key: &str,
        entry: &StoredEntry,
        preferred: Option<BackendKind>,
    ) -> Result<BackendKind> {
        let size = entry.encoded_len() as usize;
        let selected = self.select_backend(size, preferred)?;

        let fallbacks = BackendKind::WRITE_ORDER
            .iter()
            .copied()
            .filter(|&kind| kind != selected);
        let candidates = std::iter::once(selected).chain(fallbacks);

        let mut last_error = StashError::NoBackendAvailable;
        for kind in candidates {
            let Some(backend) = self.backend(kind) else {
                continue;
            };

            match backend.store(&entry.key, entry) {
                Ok(()) => {
                    tracing::debug!("Persisted {} ({} bytes) to {}", key, size, kind);
                    self.dirty.lock().remove(key);
                    self.drop_copies(&entry.key, kind);
                    return Ok(kind);
                }
                Err(e @ StashError::BackendTimeout(_)) => {
                    tracing::warn!("{} timed out storing {}, trying next backend", kind, key);
                    last_error = e;
                }
                Err(e) => {
                    tracing::warn!("Failed to persist {} to {}: {}", key, kind, e);
                    return Err(e);
                }
            }
        }

        Err(last_error)
    }

    /// Best-effort removal of a physical key from every backend but `keep`
    fn drop_copies(&self, physical: &str, keep: BackendKind) {
        for descriptor in self.registry.iter().filter(|d| d.kind != keep) {
            if let Some(backend) = descriptor.handle() {
                if let Err(e) = backend.remove(physical) {
                    tracing::debug!("Could not drop stale copy from {}: {}", descriptor.kind, e);
                }
            }
        }
    }

    // =========================================================================
    // Remove / Clear
    // =========================================================================

    /// Remove a key from the cache and every backend
    ///
    /// Backend failures are logged and tolerated; removing a missing key
    /// is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        Self::validate_key(key)?;

        {
            let _guard = self.key_locks.lock(key);
            {
                let mut cache = self.cache.write();
                self.key_locks.bump(key);
                cache.remove(key);
            }
            self.dirty.lock().remove(key);

            let physical = self.physical(key);
            for descriptor in &self.registry {
                if let Some(backend) = descriptor.handle() {
                    if let Err(e) = backend.remove(&physical) {
                        tracing::warn!("Failed to remove {} from {}: {}", key, descriptor.kind, e);
                    }
                }
            }
        }

        self.events.emit(StorageEvent::Remove {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Remove every user key from the cache and every backend
    ///
    /// Engine records (schema version, migration history, key material)
    /// survive.
    pub fn clear(&self) -> Result<()> {
        let mut removed: BTreeSet<String> = {
            let mut cache = self.cache.write();
            self.key_locks.bump_all();
            let keys = cache.keys().cloned().collect();
            cache.clear();
            keys
        };
        self.dirty.lock().clear();

        for descriptor in &self.registry {
            let Some(backend) = descriptor.handle() else {
                continue;
            };
            let keys = match backend.list_keys() {
                Ok(keys) => keys,
                Err(e) => {
                    tracing::warn!("Failed to list keys of {} for clear: {}", descriptor.kind, e);
                    continue;
                }
            };

            for physical in keys {
                let Some(key) = self.logical(&physical) else {
                    continue;
                };
                if Self::is_reserved(key) {
                    continue;
                }
                removed.insert(key.to_string());
                if let Err(e) = backend.remove(&physical) {
                    tracing::warn!("Failed to clear {} from {}: {}", key, descriptor.kind, e);
                }
            }
        }

        tracing::info!("Cleared {} keys", removed.len());
        self.events.emit(StorageEvent::Clear {
            removed: removed.len(),
            filtered: false,
        });
        Ok(())
    }

    /// Remove every key matching `filter`; returns how many were removed
    pub fn clear_where<F>(&self, filter: F) -> Result<usize>
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        for key in self.keys()? {
            if filter(&key) {
                self.remove(&key)?;
                removed += 1;
            }
        }

        self.events.emit(StorageEvent::Clear {
            removed,
            filtered: true,
        });
        Ok(removed)
    }

    /// Wipe every backend completely, engine records included
    ///
    /// The next open starts from an empty store with a fresh key.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut cache = self.cache.write();
            self.key_locks.bump_all();
            cache.clear();
        }
        self.dirty.lock().clear();
        for descriptor in &self.registry {
            if let Some(backend) = descriptor.handle() {
                backend.clear()?;
            }
        }
        tracing::warn!("All backends wiped");
        Ok(())
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    /// Every logical key, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self.cache.read().keys().cloned().collect();

        for descriptor in &self.registry {
            let Some(backend) = descriptor.handle() else {
                continue;
            };
            match backend.list_keys() {
                Ok(physical_keys) => {
                    keys.extend(
                        physical_keys
                            .iter()
                            .filter_map(|p| self.logical(p))
                            .filter(|k| !Self::is_reserved(k))
                            .map(str::to_string),
                    );
                }
                Err(e) => tracing::warn!("Failed to list keys of {}: {}", descriptor.kind, e),
            }
        }

        Ok(keys.into_iter().collect())
    }

    /// Which backend holds a key, with its raw stored entry
    pub fn locate(&self, key: &str) -> Result<Option<(BackendKind, StoredEntry)>> {
        let physical = self.physical(key);
        for descriptor in &self.registry {
            let Some(backend) = descriptor.handle() else {
                continue;
            };
            if let Some(entry) = backend.fetch(&physical)? {
                return Ok(Some((descriptor.kind, entry)));
            }
        }
        Ok(None)
    }

    /// Registry slots, for diagnostics
    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.registry
    }
}
