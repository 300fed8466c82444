//! Tests for the Storage facade
//!
//! These tests verify:
//! - Nothing is initialized until first use
//! - Subscriptions made before init see `Initialized`
//! - Startup event handlers may call back into the handle
//! - Typed get/set helpers
//! - A failed initialization is retried by the next call
//! - close flushes and reports unpersisted keys

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stashkv::backend::BackendKind;
use stashkv::{Config, EventKind, Migration, SchemaVersion, StashError, Storage, StorageEvent};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .background_maintenance(false)
        .build()
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Budget {
    category: String,
    amount: u32,
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_lazy_initialization() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("stash");
    let storage = Storage::new(config(&data_dir));

    assert!(!storage.is_initialized());
    assert!(!data_dir.exists());

    storage.set("k", &1).unwrap();

    assert!(storage.is_initialized());
    assert!(data_dir.exists());
}

#[test]
fn test_initialized_event_seen_before_init() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(config(temp.path()));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    storage.on(EventKind::Initialized, move |event| sink.lock().push(event.clone()));

    storage.init().unwrap();
    storage.init().unwrap();

    // Exactly once, however often init is called
    assert_eq!(seen.lock().len(), 1);
    assert!(matches!(seen.lock()[0], StorageEvent::Initialized { .. }));
}

#[test]
fn test_initialized_handler_can_use_storage() {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(
        Storage::new(
            Config::builder()
                .data_dir(temp.path())
                .background_maintenance(false)
                .schema_version(SchemaVersion::new(1, 1, 0))
                .build(),
        )
        .with_migration(Migration::new(
            SchemaVersion::new(1, 1, 0),
            "seed defaults",
            |manager| manager.set("currency", json!("EUR"), Default::default()),
        )),
    );

    let seen_keys = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen_keys);
    let weak = Arc::downgrade(&storage);
    storage.on(EventKind::Initialized, move |_| {
        if let Some(storage) = weak.upgrade() {
            *sink.lock() = Some(storage.keys().unwrap());
        }
    });

    let (done_tx, done_rx) = channel::bounded(1);
    let worker = Arc::clone(&storage);
    thread::spawn(move || {
        let _ = done_tx.send(worker.init().is_ok());
    });

    let initialized = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("init did not finish");
    assert!(initialized);
    assert_eq!(*seen_keys.lock(), Some(vec!["currency".to_string()]));
}

#[test]
fn test_failed_init_is_retried() {
    let temp = TempDir::new().unwrap();
    let fail = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&fail);

    let storage = Storage::new(
        Config::builder()
            .data_dir(temp.path())
            .background_maintenance(false)
            .schema_version(SchemaVersion::new(1, 1, 0))
            .build(),
    )
    .with_migration(Migration::new(
        SchemaVersion::new(1, 1, 0),
        "seed defaults",
        move |manager| {
            if flag.load(Ordering::SeqCst) {
                return Err(StashError::Validation("not yet".to_string()));
            }
            manager.set("seeded", json!(true), Default::default())
        },
    ));

    let err = storage.get("seeded").unwrap_err();
    assert!(matches!(err, StashError::Migration { .. }));
    assert!(!storage.is_initialized());

    fail.store(false, Ordering::SeqCst);

    assert_eq!(storage.get("seeded").unwrap(), Some(json!(true)));
    let history = storage.migration_history().unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history[0].success);
    assert!(history[1].success);
}

#[test]
fn test_close_flushes_and_reopens() {
    let temp = TempDir::new().unwrap();
    {
        let storage = Storage::open(config(temp.path())).unwrap();
        storage.set("k", &"v").unwrap();
        storage.close().unwrap();
    }

    let storage = Storage::new(config(temp.path()));
    assert_eq!(storage.get("k").unwrap(), Some(json!("v")));
}

#[test]
fn test_close_reports_unpersisted_keys() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::open(
        Config::builder()
            .data_dir(temp.path())
            .background_maintenance(false)
            .encryption(false)
            .quota(BackendKind::Durable, Some(300))
            .build(),
    )
    .unwrap();

    assert!(storage.set("big", &"b".repeat(500)).is_err());

    assert!(storage.close().is_err());
}

#[test]
fn test_close_uninitialized_is_noop() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(config(&temp.path().join("never")));

    storage.close().unwrap();

    assert!(!temp.path().join("never").exists());
}

#[test]
fn test_background_maintenance_runs() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(
        Config::builder()
            .data_dir(temp.path())
            .sync_interval(std::time::Duration::from_millis(10))
            .build(),
    );

    let syncs = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&syncs);
    storage.on(EventKind::Sync, move |_| *counter.lock() += 1);

    storage.init().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(150));
    storage.close().unwrap();

    // Worker ticks plus the final flush
    assert!(*syncs.lock() >= 2);
}

// =============================================================================
// Typed Access Tests
// =============================================================================

#[test]
fn test_typed_round_trip() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(config(temp.path()));
    let budget = Budget {
        category: "food".to_string(),
        amount: 500,
    };

    storage.set("budget_food", &budget).unwrap();

    assert_eq!(storage.get_as::<Budget>("budget_food").unwrap(), Some(budget));
    assert_eq!(storage.get_as::<Budget>("missing").unwrap(), None);
    assert_eq!(
        storage.get("budget_food").unwrap(),
        Some(json!({"category": "food", "amount": 500}))
    );
}

#[test]
fn test_get_as_wrong_shape_errors() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(config(temp.path()));
    storage.set("k", &"not a budget").unwrap();

    assert!(storage.get_as::<Budget>("k").is_err());
}

#[test]
fn test_get_or_default() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(config(temp.path()));

    assert_eq!(storage.get_or("theme", json!("light")).unwrap(), json!("light"));

    storage.set("theme", &"dark").unwrap();
    assert_eq!(storage.get_or("theme", json!("light")).unwrap(), json!("dark"));
}

#[test]
fn test_has_and_remove() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(config(temp.path()));

    storage.set("k", &[1, 2, 3]).unwrap();
    assert!(storage.has("k").unwrap());

    storage.remove("k").unwrap();
    assert!(!storage.has("k").unwrap());
    assert!(storage.keys().unwrap().is_empty());
}
