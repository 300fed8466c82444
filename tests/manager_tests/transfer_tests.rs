//! Tests for export and import
//!
//! These tests verify:
//! - A bundle moves data between engines holding different keys
//! - Compressed bundles survive a JSON round trip
//! - One bad entry never aborts an import
//! - Version compatibility and malformed bundles are rejected

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use stashkv::events::EventBus;
use stashkv::manager::BundleData;
use stashkv::{
    Bundle, Config, EventKind, ExportOptions, ImportOptions, SchemaVersion, SetOptions,
    StorageEvent, StorageManager,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_at(dir: &Path, schema: SchemaVersion) -> StorageManager {
    let config = Config::builder()
        .data_dir(dir)
        .background_maintenance(false)
        .schema_version(schema)
        .build();
    StorageManager::open(config, Vec::new(), Arc::new(EventBus::new())).unwrap()
}

fn setup_temp_manager() -> (TempDir, StorageManager) {
    let temp = TempDir::new().unwrap();
    let manager = open_at(temp.path(), SchemaVersion::new(1, 0, 0));
    (temp, manager)
}

// =============================================================================
// Export Tests
// =============================================================================

#[test]
fn test_export_describes_contents() {
    let (_temp, manager) = setup_temp_manager();
    manager.set("a", json!(1), SetOptions::default()).unwrap();
    manager.set("b", json!({"x": [1, 2]}), SetOptions::default()).unwrap();

    let bundle = manager.export(ExportOptions::default()).unwrap();

    assert_eq!(bundle.version, "1.0.0");
    assert_eq!(bundle.metadata.total_keys, 2);
    assert!(bundle.metadata.total_size > 0);
    assert!(!bundle.metadata.compressed);
    assert!(bundle.metadata.encrypted);

    let entries = bundle.entries().unwrap();
    assert_eq!(entries["a"], json!(1));
    assert_eq!(entries["b"], json!({"x": [1, 2]}));
    // Engine records never leave the engine
    assert!(entries.keys().all(|k| !k.starts_with("__")));
}

#[test]
fn test_bundle_json_uses_camel_case_metadata() {
    let (_temp, manager) = setup_temp_manager();
    manager.set("a", json!(1), SetOptions::default()).unwrap();

    let text = manager.export(ExportOptions::default()).unwrap().to_json().unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();

    assert_eq!(json["metadata"]["totalKeys"], 1);
    assert!(json["metadata"]["totalSize"].is_u64());
    assert_eq!(json["data"]["a"], 1);
}

// =============================================================================
// Import Tests
// =============================================================================

#[test]
fn test_budget_round_trip_between_engines() {
    let (_source_dir, source) = setup_temp_manager();
    source
        .set("budget_food", json!({"amount": 500}), SetOptions::default())
        .unwrap();
    assert_eq!(source.get("budget_food").unwrap(), Some(json!({"amount": 500})));

    let bundle = source.export(ExportOptions::default()).unwrap();

    let (_target_dir, target) = setup_temp_manager();
    let report = target.import(&bundle, ImportOptions::default()).unwrap();

    assert!(report.success);
    assert_eq!(report.imported, 1);
    assert_eq!(target.get("budget_food").unwrap(), Some(json!({"amount": 500})));
}

#[test]
fn test_compressed_bundle_round_trip() {
    let (_source_dir, source) = setup_temp_manager();
    for i in 0..50 {
        source
            .set(&format!("txn_{:03}", i), json!({"amount": i, "memo": "coffee"}), SetOptions::default())
            .unwrap();
    }

    let bundle = source.export(ExportOptions { compress: true }).unwrap();
    assert!(matches!(bundle.data, BundleData::Compressed(_)));
    let text = bundle.to_json().unwrap();

    let (_target_dir, target) = setup_temp_manager();
    let parsed = Bundle::from_json(&text).unwrap();
    let report = target.import(&parsed, ImportOptions::default()).unwrap();

    assert_eq!(report.imported, 50);
    assert_eq!(target.keys().unwrap().len(), 50);
    assert_eq!(
        target.get("txn_042").unwrap(),
        Some(json!({"amount": 42, "memo": "coffee"}))
    );
}

#[test]
fn test_partial_failure_keeps_good_entries() {
    let (_temp, manager) = setup_temp_manager();
    let bundle = Bundle::from_json(
        r#"{
            "version": "1.0.0",
            "timestamp": 0,
            "data": { "ok_1": 1, "": "empty key", "ok_2": [2] },
            "metadata": { "totalKeys": 3, "totalSize": 0, "compressed": false, "encrypted": false }
        }"#,
    )
    .unwrap();

    let report = manager.import(&bundle, ImportOptions::default()).unwrap();

    assert!(!report.success);
    assert_eq!(report.imported, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].key, "");
    assert_eq!(manager.get("ok_1").unwrap(), Some(json!(1)));
    assert_eq!(manager.get("ok_2").unwrap(), Some(json!([2])));
}

#[test]
fn test_incompatible_version_needs_force() {
    let (_source_dir, source) = setup_temp_manager();
    source.set("k", json!("v"), SetOptions::default()).unwrap();
    let bundle = source.export(ExportOptions::default()).unwrap();

    let target_dir = TempDir::new().unwrap();
    let target = open_at(target_dir.path(), SchemaVersion::new(2, 0, 0));

    let err = target.import(&bundle, ImportOptions::default()).unwrap_err();
    assert!(err.is_validation());
    assert_eq!(target.get("k").unwrap(), None);

    let forced = ImportOptions {
        force: true,
        ..ImportOptions::default()
    };
    assert_eq!(target.import(&bundle, forced).unwrap().imported, 1);
    assert_eq!(target.get("k").unwrap(), Some(json!("v")));
}

#[test]
fn test_minor_version_difference_is_compatible() {
    let (_temp, manager) = setup_temp_manager();
    let mut bundle = manager.export(ExportOptions::default()).unwrap();
    bundle.version = "1.7.3".to_string();

    assert!(manager.import(&bundle, ImportOptions::default()).is_ok());
}

#[test]
fn test_clear_existing_before_import() {
    let (_temp, manager) = setup_temp_manager();
    manager.set("old", json!(1), SetOptions::default()).unwrap();
    let bundle = Bundle::from_json(
        r#"{"version":"1.0","timestamp":0,"data":{"new":2},
            "metadata":{"totalKeys":1,"totalSize":1,"compressed":false,"encrypted":false}}"#,
    )
    .unwrap();

    manager
        .import(
            &bundle,
            ImportOptions {
                clear_existing: true,
                ..ImportOptions::default()
            },
        )
        .unwrap();

    assert_eq!(manager.keys().unwrap(), vec!["new"]);
}

#[test]
fn test_malformed_bundles_are_rejected() {
    assert!(Bundle::from_json("not json").unwrap_err().is_validation());
    assert!(Bundle::from_json(r#"{"version":"1.0.0"}"#).unwrap_err().is_validation());

    let (_temp, manager) = setup_temp_manager();
    let bundle = Bundle::from_json(
        r#"{"version":"1.0.0","timestamp":0,"data":"!!! not base64 !!!",
            "metadata":{"totalKeys":0,"totalSize":0,"compressed":true,"encrypted":false}}"#,
    )
    .unwrap();
    assert!(manager.import(&bundle, ImportOptions::default()).unwrap_err().is_validation());
}

#[test]
fn test_import_emits_event() {
    let (_temp, manager) = setup_temp_manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.events().on(EventKind::Import, move |event| sink.lock().push(event.clone()));

    let bundle = Bundle::from_json(
        r#"{"version":"1.0.0","timestamp":0,"data":{"a":1,"__b":2},
            "metadata":{"totalKeys":2,"totalSize":2,"compressed":false,"encrypted":false}}"#,
    )
    .unwrap();
    manager.import(&bundle, ImportOptions::default()).unwrap();

    assert_eq!(
        *seen.lock(),
        vec![StorageEvent::Import {
            imported: 1,
            failed: 1
        }]
    );
}
