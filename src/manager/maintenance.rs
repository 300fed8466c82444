//! Background upkeep: dirty-key sync and quota monitoring

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use crossbeam::select;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::entry::now_millis;
use crate::error::Result;
use crate::events::StorageEvent;

use super::StorageManager;

// =============================================================================
// Sync
// =============================================================================

/// A dirty key that could not be persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub key: String,
    pub error: String,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub errors: Vec<SyncFailure>,
}

// =============================================================================
// Quota
// =============================================================================

/// Pressure level of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLevel {
    Ok,
    Warning,
    Critical,
}

/// Quota evaluation of one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub backend: BackendKind,
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub usage_ratio: f64,
    pub level: QuotaLevel,
}

impl StorageManager {
    /// Persist every dirty key
    ///
    /// Successes leave the dirty set; failures stay dirty for the next
    /// pass. A key that was removed since it was dirtied is dropped.
    pub fn sync(&self) -> SyncReport {
        let pending: Vec<String> = self.dirty.lock().iter().cloned().collect();
        let mut report = SyncReport::default();

        for key in pending {
            let outcome = {
                let _guard = self.key_locks.lock(&key);
                self.sync_key(&key)
            };

            match outcome {
                Ok(Some(kind)) => {
                    tracing::debug!("Synced {} to {}", key, kind);
                    report.synced += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Sync of {} failed: {}", key, e);
                    report.failed += 1;
                    report.errors.push(SyncFailure {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.synced > 0 || report.failed > 0 {
            tracing::info!("Sync pass: {} synced, {} failed", report.synced, report.failed);
        }
        self.events.emit(StorageEvent::Sync {
            synced: report.synced,
            failed: report.failed,
        });
        report
    }

    /// Re-persist one dirty key; the caller holds its key lock
    fn sync_key(&self, key: &str) -> Result<Option<BackendKind>> {
        let cached = self.cache.read().get(key).cloned();
        let Some(cached) = cached else {
            self.dirty.lock().remove(key);
            return Ok(None);
        };
        if !self.dirty.lock().contains(key) {
            return Ok(None);
        }

        let entry = self.encode(
            self.physical(key),
            &cached.value,
            cached.value_type,
            cached.metadata,
            cached.skip_encryption,
        )?;
        let kind = self.persist(key, &entry, cached.preferred)?;

        if let Some(cached) = self.cache.write().get_mut(key) {
            cached.backend = Some(kind);
        }
        Ok(Some(kind))
    }

    /// Evaluate every available backend that has a quota
    pub fn quota_statuses(&self) -> Vec<QuotaStatus> {
        let warning = self.config.quota_warning_ratio;
        let critical = self.config.quota_critical_ratio;

        self.registry
            .iter()
            .filter_map(|descriptor| {
                let quota = descriptor.quota_bytes.filter(|q| *q > 0)?;
                let backend = descriptor.handle()?;
                let used = match backend.measure_usage() {
                    Ok(usage) => usage.bytes,
                    Err(e) => {
                        tracing::warn!("Failed to measure {}: {}", descriptor.kind, e);
                        return None;
                    }
                };

                let ratio = used as f64 / quota as f64;
                let level = if ratio >= critical {
                    QuotaLevel::Critical
                } else if ratio >= warning {
                    QuotaLevel::Warning
                } else {
                    QuotaLevel::Ok
                };

                Some(QuotaStatus {
                    backend: descriptor.kind,
                    used_bytes: used,
                    quota_bytes: quota,
                    usage_ratio: ratio,
                    level,
                })
            })
            .collect()
    }

    /// Run the quota monitor once, raising warning and critical events
    ///
    /// Advisory only: nothing is evicted.
    pub fn check_quotas(&self) -> Vec<QuotaStatus> {
        let statuses = self.quota_statuses();
        *self.quota_snapshot.write() = statuses.clone();

        for status in &statuses {
            let event = match status.level {
                QuotaLevel::Ok => continue,
                QuotaLevel::Warning => {
                    tracing::warn!(
                        "{} at {:.0}% of its quota",
                        status.backend,
                        status.usage_ratio * 100.0
                    );
                    StorageEvent::QuotaWarning {
                        backend: status.backend,
                        usage_ratio: status.usage_ratio,
                        used_bytes: status.used_bytes,
                        quota_bytes: status.quota_bytes,
                    }
                }
                QuotaLevel::Critical => {
                    tracing::warn!(
                        "{} critically full: {:.0}% of its quota",
                        status.backend,
                        status.usage_ratio * 100.0
                    );
                    StorageEvent::QuotaCritical {
                        backend: status.backend,
                        usage_ratio: status.usage_ratio,
                        used_bytes: status.used_bytes,
                        quota_bytes: status.quota_bytes,
                    }
                }
            };
            self.events.emit(event);
        }

        statuses
    }

    /// Start the background maintenance thread for this manager
    pub fn start_maintenance(self: &Arc<Self>) -> Result<Maintenance> {
        Maintenance::start(
            Arc::downgrade(self),
            self.config.sync_interval,
            self.config.quota_check_interval,
        )
    }
}

// =============================================================================
// Maintenance Worker
// =============================================================================

/// Handle on the background maintenance thread
///
/// One thread runs both ticks, so a tick always finishes before the next
/// one starts. The thread holds only a weak reference and exits on its
/// own once the manager is gone.
pub struct Maintenance {
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Maintenance {
    pub fn start(
        manager: Weak<StorageManager>,
        sync_interval: Duration,
        quota_interval: Duration,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let sync_ticks = channel::tick(sync_interval);
        let quota_ticks = channel::tick(quota_interval);

        let worker = thread::Builder::new()
            .name("stashkv-maintenance".to_string())
            .spawn(move || {
                tracing::debug!("Maintenance worker started");
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(sync_ticks) -> _ => {
                            let Some(manager) = manager.upgrade() else { break };
                            manager.sync();
                        }
                        recv(quota_ticks) -> _ => {
                            let Some(manager) = manager.upgrade() else { break };
                            let started = now_millis();
                            let statuses = manager.check_quotas();
                            tracing::trace!(
                                "Quota check of {} backends took {} ms",
                                statuses.len(),
                                now_millis().saturating_sub(started)
                            );
                        }
                    }
                }
                tracing::debug!("Maintenance worker stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    /// Stop the thread and wait for the current tick to finish
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel and wakes the worker
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Maintenance worker panicked");
            }
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}
