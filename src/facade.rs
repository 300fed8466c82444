//! Storage Facade
//!
//! The entry point applications hold on to.
//!
//! ## Responsibilities
//! - Initialize the engine exactly once, on first use
//! - Start and stop the background maintenance worker
//! - Expose the public get/set/remove/... contract with typed helpers
//! - Offer atomic read-modify-write conveniences (counters, lists, sets)
//!
//! ```text
//!   Storage ──(first call)──► StorageManager::open
//!      │                         ├── backend discovery
//!      │                         ├── crypto key setup
//!      │                         └── migrations
//!      └──────────────────────► Maintenance::start (sync + quota ticks)
//! ```

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::backend::BackendKind;
use crate::config::Config;
use crate::entry::StoredEntry;
use crate::error::{Result, StashError};
use crate::events::{EventBus, EventKind, StorageEvent, SubscriptionId};
use crate::manager::{
    Bundle, ExportOptions, GetOptions, ImportOptions, ImportReport, Maintenance, SetOptions,
    Stats, StorageManager, SyncReport,
};
use crate::migration::{Migration, MigrationRecord, SchemaVersion};

struct Engine {
    manager: Arc<StorageManager>,
    maintenance: Mutex<Option<Maintenance>>,
}

/// Lazily initialized handle on the storage engine
///
/// Cheap to construct; nothing touches the disk until the first
/// operation (or an explicit [`Storage::init`]). Share it behind an `Arc`.
pub struct Storage {
    config: Config,
    migrations: Vec<Migration>,
    events: Arc<EventBus>,
    engine: OnceCell<Engine>,
}

impl Storage {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            migrations: Vec::new(),
            events: Arc::new(EventBus::new()),
            engine: OnceCell::new(),
        }
    }

    /// Create and initialize immediately
    pub fn open(config: Config) -> Result<Self> {
        let storage = Self::new(config);
        storage.init()?;
        Ok(storage)
    }

    /// Register a migration to run on initialization
    pub fn with_migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Initialize the engine if that has not happened yet
    ///
    /// A failed initialization is retried by the next call.
    pub fn init(&self) -> Result<()> {
        self.engine().map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.get().is_some()
    }

    fn engine(&self) -> Result<&Engine> {
        if let Some(engine) = self.engine.get() {
            return Ok(engine);
        }

        // Startup events wait until the cell is filled, so their handlers
        // can call back into this handle
        let hold = self.events.hold();
        let engine = self.engine.get_or_try_init(|| {
            let manager = Arc::new(StorageManager::open(
                self.config.clone(),
                self.migrations.clone(),
                Arc::clone(&self.events),
            )?);

            let maintenance = if self.config.background_maintenance {
                Some(manager.start_maintenance()?)
            } else {
                None
            };

            Ok(Engine {
                manager,
                maintenance: Mutex::new(maintenance),
            })
        });
        drop(hold);
        engine
    }

    /// The underlying manager, initializing on demand
    pub fn manager(&self) -> Result<&Arc<StorageManager>> {
        Ok(&self.engine()?.manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Core Operations
    // =========================================================================

    /// Store any serializable value
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with(key, value, SetOptions::default())
    }

    pub fn set_with<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: SetOptions) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.manager()?.set(key, value, options)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.manager()?.get(key)
    }

    /// Get a value, or `default` when the key is absent
    pub fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Get a value deserialized into `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn get_with(&self, key: &str, options: &GetOptions) -> Result<Option<Value>> {
        self.manager()?.get_with(key, options)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.manager()?.remove(key)
    }

    /// Remove every user key
    pub fn clear(&self) -> Result<()> {
        self.manager()?.clear()
    }

    /// Remove every key matching `filter`
    pub fn clear_where<F: Fn(&str) -> bool>(&self, filter: F) -> Result<usize> {
        self.manager()?.clear_where(filter)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.manager()?.keys()
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        self.manager()?.has(key)
    }

    /// Which backend holds a key, with its raw stored entry
    pub fn locate(&self, key: &str) -> Result<Option<(BackendKind, StoredEntry)>> {
        self.manager()?.locate(key)
    }

    // =========================================================================
    // Transfer & Maintenance
    // =========================================================================

    pub fn export(&self, options: ExportOptions) -> Result<Bundle> {
        self.manager()?.export(options)
    }

    pub fn import(&self, bundle: &Bundle, options: ImportOptions) -> Result<ImportReport> {
        self.manager()?.import(bundle, options)
    }

    /// Persist every dirty key now
    pub fn sync(&self) -> Result<SyncReport> {
        Ok(self.manager()?.sync())
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(self.manager()?.stats())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Subscribe to events of `kind`
    ///
    /// Available before initialization, so `Initialized` can be observed.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.events.off(kind, id)
    }

    // =========================================================================
    // Convenience Operations
    // =========================================================================

    /// Add `by` to an integer counter (absent counts as 0); returns the new value
    pub fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let value = self.manager()?.update(key, |current| {
            let base = match current {
                None => 0,
                Some(value) => value.as_i64().ok_or_else(|| {
                    StashError::Validation(format!("{} does not hold an integer", key))
                })?,
            };
            let next = base.checked_add(by).ok_or_else(|| {
                StashError::Validation(format!("counter {} would overflow", key))
            })?;
            Ok(Value::from(next))
        })?;
        Ok(value.as_i64().unwrap_or_default())
    }

    pub fn decrement(&self, key: &str, by: i64) -> Result<i64> {
        let by = by
            .checked_neg()
            .ok_or_else(|| StashError::Validation(format!("cannot decrement by {}", by)))?;
        self.increment(key, by)
    }

    /// Append to a list (absent counts as empty); returns the new length
    pub fn push<T: Serialize + ?Sized>(&self, key: &str, item: &T) -> Result<usize> {
        let item = serde_json::to_value(item)?;
        let value = self.manager()?.update(key, |current| {
            let mut list = expect_array(key, current)?;
            list.push(item);
            Ok(Value::Array(list))
        })?;
        Ok(value.as_array().map_or(0, Vec::len))
    }

    /// Remove and return the last list item; an absent key stays absent
    pub fn pop(&self, key: &str) -> Result<Option<Value>> {
        let mut popped = None;
        self.manager()?.update_if(key, |current| {
            if current.is_none() {
                return Ok(None);
            }
            let mut list = expect_array(key, current)?;
            popped = list.pop();
            Ok(Some(Value::Array(list)))
        })?;
        Ok(popped)
    }

    /// Add to a set (a list without duplicates); returns whether it was added
    pub fn add_member<T: Serialize + ?Sized>(&self, key: &str, member: &T) -> Result<bool> {
        let member = serde_json::to_value(member)?;
        let mut added = false;
        self.manager()?.update(key, |current| {
            let mut set = expect_array(key, current)?;
            if !set.contains(&member) {
                set.push(member);
                added = true;
            }
            Ok(Value::Array(set))
        })?;
        Ok(added)
    }

    /// Remove from a set; returns whether it was present
    pub fn remove_member<T: Serialize + ?Sized>(&self, key: &str, member: &T) -> Result<bool> {
        let member = serde_json::to_value(member)?;
        let mut removed = false;
        self.manager()?.update_if(key, |current| {
            if current.is_none() {
                return Ok(None);
            }
            let mut set = expect_array(key, current)?;
            let before = set.len();
            set.retain(|m| *m != member);
            removed = set.len() != before;
            Ok(removed.then_some(Value::Array(set)))
        })?;
        Ok(removed)
    }

    pub fn has_member<T: Serialize + ?Sized>(&self, key: &str, member: &T) -> Result<bool> {
        let member = serde_json::to_value(member)?;
        Ok(match self.get(key)? {
            Some(Value::Array(set)) => set.contains(&member),
            _ => false,
        })
    }

    // =========================================================================
    // Migrations & Lifecycle
    // =========================================================================

    pub fn migration_history(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.manager()?.migration_history())
    }

    /// Undo migrations down to `target`; returns the number of steps undone
    pub fn rollback(&self, target: SchemaVersion) -> Result<usize> {
        self.manager()?.rollback(target)
    }

    /// Stop background work and flush dirty keys
    ///
    /// Fails if some keys could not be persisted; they stay in the cache
    /// of this (now closed) handle only.
    pub fn close(self) -> Result<()> {
        let Some(engine) = self.engine.get() else {
            return Ok(());
        };

        if let Some(mut maintenance) = engine.maintenance.lock().take() {
            maintenance.stop();
        }

        let report = engine.manager.sync();
        tracing::info!("Storage closed");
        if report.failed > 0 {
            return Err(StashError::Storage(format!(
                "{} keys could not be persisted on close",
                report.failed
            )));
        }
        Ok(())
    }
}

/// Current list value of a key, treating absence as empty
fn expect_array(key: &str, current: Option<Value>) -> Result<Vec<Value>> {
    match current {
        None => Ok(Vec::new()),
        Some(Value::Array(list)) => Ok(list),
        Some(other) => Err(StashError::Validation(format!(
            "{} holds a {}, not a list",
            key,
            crate::entry::type_of(&other)
        ))),
    }
}
