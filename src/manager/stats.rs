//! Engine statistics

use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendStatus, Usage};
use crate::migration::SchemaVersion;

use super::{QuotaStatus, StorageManager};

/// Cache occupancy and hit counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of reads served from the cache
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub backends: Vec<BackendStatus>,
    pub cache: CacheStats,
    pub quota: Vec<QuotaStatus>,
    /// Sum over every available backend
    pub usage: Usage,
    pub encryption: bool,
    pub compression: bool,
    pub schema_version: SchemaVersion,
}

impl StorageManager {
    pub fn stats(&self) -> Stats {
        let backends: Vec<BackendStatus> = self.registry.iter().map(|d| d.status()).collect();

        let usage = backends
            .iter()
            .filter_map(|b| b.usage)
            .fold(Usage::default(), |total, u| Usage {
                items: total.items + u.items,
                bytes: total.bytes + u.bytes,
            });

        let cache = CacheStats {
            entries: self.cache.read().len(),
            dirty: self.dirty.lock().len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        };

        Stats {
            backends,
            cache,
            quota: self.quota_statuses(),
            usage,
            encryption: self.encryption_enabled(),
            compression: self.compressor.is_enabled(),
            schema_version: self.stored_schema_version(),
        }
    }

    /// Quota evaluation made by the last monitor tick
    pub fn last_quota_check(&self) -> Vec<QuotaStatus> {
        self.quota_snapshot.read().clone()
    }
}
