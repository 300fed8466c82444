//! Storage Manager
//!
//! The orchestrator that coordinates cache, backends, codecs and
//! migrations.
//!
//! ## Responsibilities
//! - Discover backends on startup and keep the registry
//! - Set up (or disable) at-rest encryption
//! - Run pending migrations before serving requests
//! - Serve get/set/remove/clear/keys/export/import through a read-through,
//!   write-through cache
//! - Track dirty keys and drain them on sync
//! - Monitor quotas and raise events

mod maintenance;
mod operations;
mod stats;
mod transfer;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::{Map, Value};

use crate::backend::{Backend, BackendDescriptor, BackendKind};
use crate::compression::Compressor;
use crate::config::Config;
use crate::crypto::{self, Cipher, KeyMaterial};
use crate::entry::{now_millis, EntryMetadata, StoredEntry, StoredValue};
use crate::error::{Result, StashError};
use crate::events::{EventBus, StorageEvent};
use crate::migration::{Migration, MigrationRecord, MigrationRunner, SchemaVersion};

pub use maintenance::{Maintenance, QuotaLevel, QuotaStatus, SyncFailure, SyncReport};
pub use stats::{CacheStats, Stats};
pub use transfer::{
    Bundle, BundleData, BundleMetadata, ExportOptions, ImportFailure, ImportOptions, ImportReport,
};

// =============================================================================
// Reserved Keys
// =============================================================================

/// Logical keys starting with this are reserved for the engine
pub const RESERVED_PREFIX: &str = "__";

/// Stored schema version
pub const SCHEMA_VERSION_KEY: &str = "__schema_version";

/// Migration history
pub const MIGRATION_HISTORY_KEY: &str = "__migration_history";

/// Exported symmetric key material
pub const CRYPTO_KEY: &str = "__crypto_key";

/// Number of stripes in the per-key write lock table
const KEY_LOCK_STRIPES: usize = 64;

// =============================================================================
// Operation Options
// =============================================================================

/// Options of a write
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Type tag recorded with the entry (defaults to the JSON kind)
    pub value_type: Option<String>,
    /// Caller metadata merged into the entry metadata
    pub metadata: Map<String, Value>,
    /// Backend to use instead of the selection algorithm
    pub backend: Option<BackendKind>,
    /// Store this entry in plaintext even when encryption is enabled
    pub skip_encryption: bool,
}

impl SetOptions {
    pub fn value_type(mut self, value_type: impl Into<String>) -> Self {
        self.value_type = Some(value_type.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    pub fn skip_encryption(mut self) -> Self {
        self.skip_encryption = true;
        self
    }
}

/// Options of a read
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Bypass the cache and read from the backends
    pub skip_cache: bool,
    /// Returned when no backend holds the key
    pub default: Option<Value>,
}

impl GetOptions {
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

// =============================================================================
// Cache
// =============================================================================

/// A decoded entry held in the cache
#[derive(Debug, Clone)]
pub(crate) struct CachedEntry {
    pub value: Value,
    pub value_type: String,
    pub metadata: EntryMetadata,
    /// Backend the entry was last persisted to or read from
    pub backend: Option<BackendKind>,
    /// Write options to reuse when a dirty entry is re-persisted
    pub preferred: Option<BackendKind>,
    pub skip_encryption: bool,
}

/// Striped per-key write locks
///
/// Writes to one key are serialized from cache update through backend
/// persist, so the persisted value always follows call order.
///
/// Each stripe also carries a write generation, bumped (under the cache
/// write lock) whenever a key of the stripe is written or removed. A
/// backend read only fills the cache if the generation it saw before the
/// fetch is unchanged, so a slow read never replaces a newer write.
struct KeyLocks {
    stripes: Vec<Mutex<()>>,
    generations: Vec<AtomicU64>,
}

impl KeyLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
            generations: (0..count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn stripe(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(key)].lock()
    }

    fn generation(&self, key: &str) -> u64 {
        self.generations[self.stripe(key)].load(Ordering::Acquire)
    }

    fn bump(&self, key: &str) {
        self.generations[self.stripe(key)].fetch_add(1, Ordering::AcqRel);
    }

    fn bump_all(&self) {
        for generation in &self.generations {
            generation.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

// =============================================================================
// Storage Manager
// =============================================================================

/// The storage engine
///
/// ## Concurrency
/// - `cache`: RwLock (many concurrent readers, exclusive writer)
/// - `dirty`: Mutex, held only briefly
/// - `key_locks`: serialize writes per key (striped)
/// - All methods take `&self`; share the manager behind an `Arc`
///
/// Lock order: key stripe → cache → dirty. Events are emitted only after
/// every lock is released, so handlers may call back into the engine.
pub struct StorageManager {
    config: Config,

    /// Backend registry in lookup order (transactional → memory)
    registry: Vec<BackendDescriptor>,

    cache: RwLock<HashMap<String, CachedEntry>>,
    dirty: Mutex<HashSet<String>>,
    key_locks: KeyLocks,
    counters: CacheCounters,

    /// `None` when encryption is off or its setup failed
    cipher: Option<Cipher>,
    compressor: Compressor,

    events: Arc<EventBus>,

    migrations: Vec<Migration>,
    schema_version: RwLock<SchemaVersion>,
    history: Mutex<Vec<MigrationRecord>>,

    /// Last quota evaluation made by the monitor
    quota_snapshot: RwLock<Vec<QuotaStatus>>,
}

impl StorageManager {
    /// Open the engine
    ///
    /// On startup:
    /// 1. Discover backends (absent media are reported, not fatal)
    /// 2. Import or generate the encryption key (failure disables encryption)
    /// 3. Load the stored schema version and run pending migrations
    /// 4. Emit `Initialized`
    ///
    /// Events raised while opening are delivered when `open` returns.
    pub fn open(config: Config, mut migrations: Vec<Migration>, events: Arc<EventBus>) -> Result<Self> {
        let bus = Arc::clone(&events);
        let _hold = bus.hold();

        config.validate()?;

        migrations.sort_by_key(|m| m.version);
        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(StashError::Config(format!(
                "migration {} registered twice",
                pair[0].version
            )));
        }

        // Step 1: Backend discovery
        let registry: Vec<BackendDescriptor> = BackendKind::LOOKUP_ORDER
            .iter()
            .map(|&kind| BackendDescriptor::discover(kind, &config))
            .collect();

        if !registry.iter().any(BackendDescriptor::is_available) {
            return Err(StashError::NoBackendAvailable);
        }

        // Step 2: Crypto setup
        let cipher = if config.encryption {
            match Self::setup_cipher(&registry, &config) {
                Ok(cipher) => Some(cipher),
                Err(e) => {
                    tracing::warn!("Encryption disabled for this session: {}", e);
                    events.emit(StorageEvent::EncryptionDisabled {
                        reason: e.to_string(),
                    });
                    None
                }
            }
        } else {
            None
        };

        let compressor = Compressor::new(config.compression, config.compression_threshold);

        let manager = Self {
            config,
            registry,
            cache: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            key_locks: KeyLocks::new(KEY_LOCK_STRIPES),
            counters: CacheCounters::default(),
            cipher,
            compressor,
            events,
            migrations,
            schema_version: RwLock::new(SchemaVersion::INITIAL),
            history: Mutex::new(Vec::new()),
            quota_snapshot: RwLock::new(Vec::new()),
        };

        // Step 3: Migrations
        manager.load_migration_state()?;
        MigrationRunner::new(&manager).run(manager.config.schema_version)?;

        // Step 4: Ready
        let available = manager.available_backends();
        tracing::info!(
            "Storage engine ready: backends={:?}, encryption={}, schema={}",
            available,
            manager.cipher.is_some(),
            manager.stored_schema_version()
        );
        manager.events.emit(StorageEvent::Initialized {
            backends: available,
            encryption: manager.cipher.is_some(),
            schema_version: manager.stored_schema_version(),
        });

        Ok(manager)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Whether entries are currently encrypted at rest
    pub fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Kinds of the backends that are available, in lookup order
    pub fn available_backends(&self) -> Vec<BackendKind> {
        self.registry
            .iter()
            .filter(|d| d.is_available())
            .map(|d| d.kind)
            .collect()
    }

    /// The live handle of a backend, if it is available
    pub fn backend(&self, kind: BackendKind) -> Option<&Backend> {
        self.registry
            .iter()
            .find(|d| d.kind == kind)
            .and_then(BackendDescriptor::handle)
    }

    /// Registered migrations, ascending
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Every recorded migration attempt, oldest first
    pub fn migration_history(&self) -> Vec<MigrationRecord> {
        self.history.lock().clone()
    }

    /// Schema version the stored data is at
    pub fn stored_schema_version(&self) -> SchemaVersion {
        *self.schema_version.read()
    }

    /// Undo migrations down to `target`
    pub fn rollback(&self, target: SchemaVersion) -> Result<usize> {
        MigrationRunner::new(self).rollback(target)
    }

    // =========================================================================
    // Key Namespacing
    // =========================================================================

    /// Physical key for a logical key
    pub(crate) fn physical(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Logical key for a physical key, if it belongs to this namespace
    pub(crate) fn logical<'k>(&self, physical: &'k str) -> Option<&'k str> {
        physical.strip_prefix(self.config.key_prefix.as_str())
    }

    pub(crate) fn is_reserved(key: &str) -> bool {
        key.starts_with(RESERVED_PREFIX)
    }

    /// Reject keys callers may not write
    pub(crate) fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StashError::Validation("key must be a non-empty string".to_string()));
        }
        if Self::is_reserved(key) {
            return Err(StashError::Validation(format!(
                "key {:?} uses the reserved prefix {:?}",
                key, RESERVED_PREFIX
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Reserved Records
    // =========================================================================

    /// Most durable available backend
    fn primary(&self) -> Result<&Backend> {
        self.registry
            .iter()
            .find_map(BackendDescriptor::handle)
            .ok_or(StashError::NoBackendAvailable)
    }

    /// Find or create the encryption key across the registry
    fn setup_cipher(registry: &[BackendDescriptor], config: &Config) -> Result<Cipher> {
        let physical = format!("{}{}", config.key_prefix, CRYPTO_KEY);

        for backend in registry.iter().filter_map(BackendDescriptor::handle) {
            match backend.fetch(&physical) {
                Ok(Some(entry)) => {
                    let key = crypto::key_from_record(&entry)?;
                    tracing::debug!("Imported encryption key from {}", backend.kind());
                    return Cipher::new(&key);
                }
                Ok(None) => continue,
                Err(e) => tracing::warn!("Failed to look up key material in {}: {}", backend.kind(), e),
            }
        }

        let primary = registry
            .iter()
            .find_map(BackendDescriptor::handle)
            .ok_or(StashError::NoBackendAvailable)?;
        let key = KeyMaterial::generate();
        let record = crypto::key_record(&key, &physical, &config.schema_version.to_string());
        primary.store(&physical, &record)?;
        tracing::info!("Generated new encryption key, persisted in {}", primary.kind());

        Cipher::new(&key)
    }

    fn read_reserved(&self, name: &str) -> Result<Option<Value>> {
        let physical = self.physical(name);
        for backend in self.registry.iter().filter_map(BackendDescriptor::handle) {
            match backend.fetch(&physical) {
                Ok(Some(entry)) => {
                    return match entry.value {
                        StoredValue::Plain(value) => Ok(Some(value)),
                        _ => Err(StashError::Storage(format!(
                            "reserved record {} has an unexpected shape",
                            name
                        ))),
                    };
                }
                Ok(None) => continue,
                Err(e) => tracing::warn!("Failed to read {} from {}: {}", name, backend.kind(), e),
            }
        }
        Ok(None)
    }

    fn write_reserved(&self, name: &str, value: Value) -> Result<()> {
        let physical = self.physical(name);
        let now = now_millis();
        let entry = StoredEntry {
            key: physical.clone(),
            timestamp: now,
            value_type: crate::entry::type_of(&value).to_string(),
            value: StoredValue::Plain(value),
            metadata: EntryMetadata::new(self.stored_schema_version().to_string()),
            encrypted: false,
            compressed: false,
            original_size: None,
            compressed_size: None,
        };
        self.primary()?.store(&physical, &entry)
    }

    fn load_migration_state(&self) -> Result<()> {
        if let Some(value) = self.read_reserved(SCHEMA_VERSION_KEY)? {
            let text = value.as_str().ok_or_else(|| {
                StashError::Storage("stored schema version is not a string".to_string())
            })?;
            *self.schema_version.write() = SchemaVersion::parse(text)?;
        }
        if let Some(value) = self.read_reserved(MIGRATION_HISTORY_KEY)? {
            *self.history.lock() = serde_json::from_value(value)?;
        }
        Ok(())
    }

    pub(crate) fn set_stored_schema_version(&self, version: SchemaVersion) -> Result<()> {
        self.write_reserved(SCHEMA_VERSION_KEY, Value::String(version.to_string()))?;
        *self.schema_version.write() = version;
        Ok(())
    }

    pub(crate) fn record_migration(&self, record: MigrationRecord) -> Result<()> {
        let snapshot = {
            let mut history = self.history.lock();
            history.push(record);
            serde_json::to_value(&*history)?
        };
        self.write_reserved(MIGRATION_HISTORY_KEY, snapshot)
    }

    // =========================================================================
    // Entry Codec
    // =========================================================================

    /// Turn a value into its stored form: serialize → compress → encrypt
    fn encode(
        &self,
        physical: String,
        value: &Value,
        value_type: String,
        metadata: EntryMetadata,
        skip_encryption: bool,
    ) -> Result<StoredEntry> {
        let json = serde_json::to_vec(value)?;
        let packed = self.compressor.compress(&json)?;

        let (original_size, compressed_size) = match &packed {
            Some(c) => (Some(c.original_size), Some(c.compressed_size)),
            None => (None, None),
        };
        let compressed = packed.is_some();

        let (stored, encrypted) = match (&self.cipher, skip_encryption) {
            (Some(cipher), false) => {
                let plain = match &packed {
                    Some(c) => c.data.as_slice(),
                    None => json.as_slice(),
                };
                (StoredValue::Sealed(cipher.encrypt(plain)?), true)
            }
            _ => match packed {
                Some(c) => (StoredValue::Packed(c.data), false),
                None => (StoredValue::Plain(value.clone()), false),
            },
        };

        Ok(StoredEntry {
            key: physical,
            value: stored,
            timestamp: metadata.created,
            value_type,
            metadata,
            encrypted,
            compressed,
            original_size,
            compressed_size,
        })
    }

    /// Recover the value of a stored entry: decrypt → decompress → parse
    pub(crate) fn decode(&self, entry: &StoredEntry) -> Result<Value> {
        let bytes = match &entry.value {
            StoredValue::Plain(value) => return Ok(value.clone()),
            StoredValue::Packed(data) => data.clone(),
            StoredValue::Sealed(sealed) => {
                let cipher = self.cipher.as_ref().ok_or_else(|| {
                    StashError::Crypto(format!(
                        "entry {} is encrypted but encryption is unavailable",
                        entry.key
                    ))
                })?;
                cipher.decrypt(sealed)?
            }
        };

        let json = if entry.compressed {
            self.compressor.decompress(&bytes)?
        } else {
            bytes
        };
        Ok(serde_json::from_slice(&json)?)
    }
}
