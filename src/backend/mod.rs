//! Backend Module
//!
//! The four storage media the engine can persist entries to.
//!
//! ## Responsibilities
//! - Map store/fetch/remove/clear/list_keys/measure_usage onto one medium
//! - Report an absent or broken medium as unavailable instead of failing
//! - Enforce per-medium quotas
//!
//! ## Media
//! ```text
//! ┌───────────────┬──────────────────────────────┬────────────┬──────────┐
//! │ Kind          │ Medium                       │ Durability │ Quota    │
//! ├───────────────┼──────────────────────────────┼────────────┼──────────┤
//! │ Transactional │ CRC-framed record log, worker│ disk       │ largest  │
//! │ Durable       │ snapshot file, direct calls  │ disk       │ small    │
//! │ Session       │ string map, direct calls     │ process    │ small    │
//! │ Memory        │ ordered entry map            │ process    │ none     │
//! └───────────────┴──────────────────────────────┴────────────┴──────────┘
//! ```

mod durable;
mod memory;
mod session;
mod transactional;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::entry::StoredEntry;
use crate::error::{Result, StashError};

pub use durable::DurableStore;
pub use memory::MemoryStore;
pub use session::SessionStore;
pub use transactional::{LogOp, LogRecord, LogStore, RecoveryResult, TransactionalStore};

// =============================================================================
// Backend Kind
// =============================================================================

/// The closed set of backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Transactional,
    Durable,
    Session,
    Memory,
}

impl BackendKind {
    /// Order in which `get` consults backends (most durable first)
    pub const LOOKUP_ORDER: [BackendKind; 4] = [
        BackendKind::Transactional,
        BackendKind::Durable,
        BackendKind::Session,
        BackendKind::Memory,
    ];

    /// Order in which ordinary writes pick a backend
    pub const WRITE_ORDER: [BackendKind; 3] =
        [BackendKind::Durable, BackendKind::Session, BackendKind::Memory];

    /// Stable name used in logs, events and the CLI
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::Durable => "durable",
            Self::Session => "session",
            Self::Memory => "memory",
        }
    }

    /// Whether the medium survives a process restart
    pub fn is_persistent(self) -> bool {
        matches!(self, Self::Transactional | Self::Durable)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transactional" => Ok(Self::Transactional),
            "durable" => Ok(Self::Durable),
            "session" => Ok(Self::Session),
            "memory" => Ok(Self::Memory),
            other => Err(StashError::Validation(format!("unknown backend: {}", other))),
        }
    }
}

// =============================================================================
// Adapter Contract
// =============================================================================

/// Item count and byte footprint of one medium
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub items: u64,
    pub bytes: u64,
}

/// Operations every medium provides
///
/// Keys passed here are physical (already prefixed).
pub trait BackendAdapter {
    fn store(&self, key: &str, entry: &StoredEntry) -> Result<()>;
    fn fetch(&self, key: &str) -> Result<Option<StoredEntry>>;
    fn remove(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn list_keys(&self) -> Result<Vec<String>>;
    fn measure_usage(&self) -> Result<Usage>;
}

/// A live handle on one medium
pub enum Backend {
    Transactional(TransactionalStore),
    Durable(DurableStore),
    Session(SessionStore),
    Memory(MemoryStore),
}

impl Backend {
    /// Open the medium of `kind` as described by `config`
    pub fn open(kind: BackendKind, config: &Config) -> Result<Self> {
        let quota = config.quota_for(kind);
        match kind {
            BackendKind::Transactional => Ok(Backend::Transactional(TransactionalStore::open(
                &config.data_dir,
                quota,
                config.backend_timeout,
            )?)),
            BackendKind::Durable => Ok(Backend::Durable(DurableStore::open(&config.data_dir, quota)?)),
            BackendKind::Session => Ok(Backend::Session(SessionStore::new(quota))),
            BackendKind::Memory => Ok(Backend::Memory(MemoryStore::new())),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Transactional(_) => BackendKind::Transactional,
            Backend::Durable(_) => BackendKind::Durable,
            Backend::Session(_) => BackendKind::Session,
            Backend::Memory(_) => BackendKind::Memory,
        }
    }

    fn adapter(&self) -> &dyn BackendAdapter {
        match self {
            Backend::Transactional(b) => b,
            Backend::Durable(b) => b,
            Backend::Session(b) => b,
            Backend::Memory(b) => b,
        }
    }

    pub fn store(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        self.adapter().store(key, entry)
    }

    pub fn fetch(&self, key: &str) -> Result<Option<StoredEntry>> {
        self.adapter().fetch(key)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.adapter().remove(key)
    }

    pub fn clear(&self) -> Result<()> {
        self.adapter().clear()
    }

    pub fn list_keys(&self) -> Result<Vec<String>> {
        self.adapter().list_keys()
    }

    pub fn measure_usage(&self) -> Result<Usage> {
        self.adapter().measure_usage()
    }
}

// =============================================================================
// Registry Descriptor
// =============================================================================

/// One slot of the backend registry
///
/// An unavailable medium keeps its slot (so stats can report it) but
/// carries no handle.
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub quota_bytes: Option<u64>,
    handle: Option<Backend>,
}

impl BackendDescriptor {
    /// Probe a medium; failure to open is logged and leaves it unavailable
    pub fn discover(kind: BackendKind, config: &Config) -> Self {
        let quota_bytes = config.quota_for(kind);

        if config.disabled_backends.contains(&kind) {
            tracing::info!("Backend {} disabled by configuration", kind);
            return Self { kind, quota_bytes, handle: None };
        }

        let handle = match Backend::open(kind, config) {
            Ok(backend) => Some(backend),
            Err(e) => {
                tracing::warn!("Backend {} unavailable: {}", kind, e);
                None
            }
        };

        Self { kind, quota_bytes, handle }
    }

    pub fn is_available(&self) -> bool {
        self.handle.is_some()
    }

    /// The live handle, if the medium is available
    pub fn handle(&self) -> Option<&Backend> {
        self.handle.as_ref()
    }

    /// Snapshot for stats; usage is `None` when it cannot be measured
    pub fn status(&self) -> BackendStatus {
        let usage = self.handle.as_ref().and_then(|b| match b.measure_usage() {
            Ok(usage) => Some(usage),
            Err(e) => {
                tracing::warn!("Failed to measure usage of {}: {}", self.kind, e);
                None
            }
        });

        BackendStatus {
            kind: self.kind,
            available: self.is_available(),
            quota_bytes: self.quota_bytes,
            usage,
        }
    }
}

/// Externally visible state of one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub available: bool,
    pub quota_bytes: Option<u64>,
    pub usage: Option<Usage>,
}

/// Reject a write that would push a medium past its quota
pub(crate) fn check_quota(
    kind: BackendKind,
    quota: Option<u64>,
    current_bytes: u64,
    replaced_bytes: u64,
    incoming_bytes: u64,
) -> Result<()> {
    if let Some(quota) = quota {
        let needed = current_bytes.saturating_sub(replaced_bytes) + incoming_bytes;
        if needed > quota {
            return Err(StashError::QuotaExceeded {
                backend: kind,
                needed,
                quota,
            });
        }
    }
    Ok(())
}
