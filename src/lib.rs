//! # StashKV
//!
//! An embedded persistence engine over several storage media with:
//! - Automatic backend selection and fallback by size, durability and availability
//! - Transparent at-rest encryption (AES-256-GCM) and compression (DEFLATE)
//! - Versioned schema migrations with history and rollback
//! - Quota monitoring, dirty-key sync and typed events
//! - Bulk export/import through versioned bundles
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Storage (facade)                         │
//! │          lazy init, typed helpers, conveniences             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   StorageManager                            │
//! │   cache + dirty set, selection, codec, migrations, events   │
//! └──────┬──────────────┬──────────────┬──────────────┬─────────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌─────────────┐┌─────────────┐┌─────────────┐┌─────────────┐
//! │Transactional││   Durable   ││   Session   ││   Memory    │
//! │ (log+worker)││ (snapshot)  ││ (str map)   ││ (BTreeMap)  │
//! └─────────────┘└─────────────┘└─────────────┘└─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod entry;
pub mod backend;
pub mod crypto;
pub mod compression;
pub mod events;
pub mod migration;
pub mod manager;
pub mod facade;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{StashError, Result};
pub use config::Config;
pub use backend::BackendKind;
pub use events::{EventKind, StorageEvent, SubscriptionId};
pub use facade::Storage;
pub use manager::{
    Bundle, ExportOptions, GetOptions, ImportOptions, ImportReport, SetOptions, Stats,
    StorageManager, SyncReport,
};
pub use migration::{Migration, SchemaVersion};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of StashKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
