//! Events
//!
//! Typed notifications flowing from the engine to its consumers.
//! Handlers are registered per event kind and called synchronously on the
//! thread that raised the event, after every engine lock is released.
//!
//! While the engine is opening, the bus is held: events raised during
//! startup (key setup, migrations, `Initialized`) are queued and delivered
//! once initialization has completed, so a handler may use the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::migration::SchemaVersion;

/// Discriminant of [`StorageEvent`], used for subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Initialized,
    Set,
    Get,
    Remove,
    Clear,
    Import,
    Sync,
    QuotaWarning,
    QuotaCritical,
    QuotaExceeded,
    EncryptionDisabled,
}

/// Something the engine did or noticed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum StorageEvent {
    Initialized {
        backends: Vec<BackendKind>,
        encryption: bool,
        schema_version: SchemaVersion,
    },
    Set {
        key: String,
        backend: BackendKind,
    },
    Get {
        key: String,
        backend: BackendKind,
    },
    Remove {
        key: String,
    },
    Clear {
        removed: usize,
        filtered: bool,
    },
    Import {
        imported: usize,
        failed: usize,
    },
    Sync {
        synced: usize,
        failed: usize,
    },
    QuotaWarning {
        backend: BackendKind,
        usage_ratio: f64,
        used_bytes: u64,
        quota_bytes: u64,
    },
    QuotaCritical {
        backend: BackendKind,
        usage_ratio: f64,
        used_bytes: u64,
        quota_bytes: u64,
    },
    QuotaExceeded {
        backend: BackendKind,
        key: String,
        needed: u64,
        quota: u64,
    },
    EncryptionDisabled {
        reason: String,
    },
}

impl StorageEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StorageEvent::Initialized { .. } => EventKind::Initialized,
            StorageEvent::Set { .. } => EventKind::Set,
            StorageEvent::Get { .. } => EventKind::Get,
            StorageEvent::Remove { .. } => EventKind::Remove,
            StorageEvent::Clear { .. } => EventKind::Clear,
            StorageEvent::Import { .. } => EventKind::Import,
            StorageEvent::Sync { .. } => EventKind::Sync,
            StorageEvent::QuotaWarning { .. } => EventKind::QuotaWarning,
            StorageEvent::QuotaCritical { .. } => EventKind::QuotaCritical,
            StorageEvent::QuotaExceeded { .. } => EventKind::QuotaExceeded,
            StorageEvent::EncryptionDisabled { .. } => EventKind::EncryptionDisabled,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

/// Per-kind handler registry
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    held: Mutex<Held>,
}

/// Nesting depth of active holds and the events they queued
#[derive(Default)]
struct Held {
    depth: usize,
    queue: Vec<StorageEvent>,
}

/// Queues events until dropped; the outermost hold delivers them
pub(crate) struct EventHold<'a> {
    bus: &'a EventBus,
}

impl Drop for EventHold<'_> {
    fn drop(&mut self) {
        let queued = {
            let mut held = self.bus.held.lock();
            held.depth = held.depth.saturating_sub(1);
            if held.depth > 0 {
                return;
            }
            std::mem::take(&mut held.queue)
        };

        for event in queued {
            self.bus.deliver(&event);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(sub, _)| *sub != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Deliver `event` to every handler of its kind, or queue it while held
    pub fn emit(&self, event: StorageEvent) {
        {
            let mut held = self.held.lock();
            if held.depth > 0 {
                held.queue.push(event);
                return;
            }
        }
        self.deliver(&event);
    }

    /// Queue events until the returned hold is dropped
    pub(crate) fn hold(&self) -> EventHold<'_> {
        self.held.lock().depth += 1;
        EventHold { bus: self }
    }

    fn deliver(&self, event: &StorageEvent) {
        // Snapshot so handlers may (un)subscribe without deadlocking
        let targets: Vec<Handler> = match self.handlers.read().get(&event.kind()) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        for handler in targets {
            handler(event);
        }
    }

    /// Number of handlers registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}
