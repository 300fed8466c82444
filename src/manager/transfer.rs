//! Bulk export and import
//!
//! A bundle is a versioned, self-describing snapshot of every logical key
//! and its decoded value. Values travel in plaintext so a bundle can be
//! loaded into an engine holding a different key.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::compression::{deflate, inflate};
use crate::entry::now_millis;
use crate::error::{Result, StashError};
use crate::events::StorageEvent;
use crate::migration::SchemaVersion;

use super::{SetOptions, StorageManager};

// =============================================================================
// Bundle
// =============================================================================

/// Exported snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    /// Schema version of the exporting engine
    pub version: String,
    pub timestamp: u64,
    pub data: BundleData,
    pub metadata: BundleMetadata,
}

/// Bundle payload: the key/value map, or its DEFLATE form in base64
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundleData {
    Entries(Map<String, Value>),
    Compressed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub total_keys: usize,
    /// Serialized size of all values, before bundle compression
    pub total_size: u64,
    pub compressed: bool,
    /// Whether the exporting engine kept entries encrypted at rest
    pub encrypted: bool,
}

impl Bundle {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a bundle; a structurally malformed one is a validation error
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StashError::Validation(format!("malformed bundle: {}", e)))
    }

    /// The key/value map, inflating it if needed
    pub fn entries(&self) -> Result<Map<String, Value>> {
        match &self.data {
            BundleData::Entries(map) => Ok(map.clone()),
            BundleData::Compressed(blob) => {
                let packed = STANDARD
                    .decode(blob)
                    .map_err(|e| StashError::Validation(format!("bundle payload is not base64: {}", e)))?;
                let json = inflate(&packed)?;
                serde_json::from_slice(&json)
                    .map_err(|e| StashError::Validation(format!("bundle payload is not a key map: {}", e)))
            }
        }
    }
}

// =============================================================================
// Options & Reports
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Deflate the key/value map into a single base64 blob
    pub compress: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Remove every existing user key first
    pub clear_existing: bool,
    /// Skip the version compatibility check
    pub force: bool,
    /// Store imported entries in plaintext
    pub skip_encryption: bool,
}

/// A bundle entry that could not be imported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// True when no entry failed
    pub success: bool,
    pub imported: usize,
    pub failed: usize,
    pub errors: Vec<ImportFailure>,
}

// =============================================================================
// Export / Import
// =============================================================================

impl StorageManager {
    /// Snapshot every logical key and its decoded value
    pub fn export(&self, options: ExportOptions) -> Result<Bundle> {
        let mut entries = Map::new();
        let mut total_size = 0u64;

        for key in self.keys()? {
            match self.get(&key)? {
                Some(value) => {
                    total_size += serde_json::to_vec(&value)?.len() as u64;
                    entries.insert(key, value);
                }
                None => tracing::warn!("Key {} vanished during export", key),
            }
        }

        let total_keys = entries.len();
        let data = if options.compress {
            let json = serde_json::to_vec(&entries)?;
            BundleData::Compressed(STANDARD.encode(deflate(&json)?))
        } else {
            BundleData::Entries(entries)
        };

        tracing::info!("Exported {} keys ({} bytes)", total_keys, total_size);
        Ok(Bundle {
            version: self.stored_schema_version().to_string(),
            timestamp: now_millis(),
            data,
            metadata: BundleMetadata {
                total_keys,
                total_size,
                compressed: options.compress,
                encrypted: self.encryption_enabled(),
            },
        })
    }

    /// Load a bundle, writing each entry independently
    ///
    /// One bad entry never aborts the import; it is counted and reported.
    /// An incompatible version (different major) or an unreadable payload
    /// fails the whole call.
    pub fn import(&self, bundle: &Bundle, options: ImportOptions) -> Result<ImportReport> {
        if !options.force {
            let incoming = SchemaVersion::parse(&bundle.version)?;
            let running = self.stored_schema_version();
            if incoming.major != running.major {
                return Err(StashError::Validation(format!(
                    "bundle version {} is incompatible with schema {}",
                    incoming, running
                )));
            }
        }

        let entries = bundle.entries()?;

        if options.clear_existing {
            self.clear()?;
        }

        let mut report = ImportReport::default();
        for (key, value) in entries {
            let mut set_options = SetOptions::default();
            if options.skip_encryption {
                set_options = set_options.skip_encryption();
            }

            match self.set(&key, value, set_options) {
                Ok(()) => report.imported += 1,
                Err(e) => {
                    tracing::warn!("Failed to import {:?}: {}", key, e);
                    report.failed += 1;
                    report.errors.push(ImportFailure {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.success = report.failed == 0;

        tracing::info!("Imported {} keys, {} failed", report.imported, report.failed);
        self.events.emit(StorageEvent::Import {
            imported: report.imported,
            failed: report.failed,
        });
        Ok(report)
    }
}
