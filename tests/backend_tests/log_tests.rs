//! Tests for the record log
//!
//! These tests verify:
//! - Replay of a clean log on open
//! - Torn tail truncation
//! - Corrupted frames are skipped, not fatal
//! - Quota rejection
//! - Compaction keeps the live set

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use stashkv::backend::{BackendKind, LogOp, LogRecord, LogStore};
use stashkv::StashError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn log_path(dir: &Path) -> PathBuf {
    dir.join("records.log")
}

fn write_puts(dir: &Path, count: usize) {
    let (mut store, _) = LogStore::open(dir, None).unwrap();
    for i in 0..count {
        store
            .put(&format!("key{}", i), format!("entry{}", i).into_bytes())
            .unwrap();
    }
}

fn append_bytes(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_open_empty_directory() {
    let temp = TempDir::new().unwrap();
    let (store, recovery) = LogStore::open(temp.path(), None).unwrap();

    assert_eq!(recovery.entries_recovered, 0);
    assert_eq!(recovery.last_lsn, 0);
    assert!(!recovery.was_truncated);
    assert!(store.keys().is_empty());
}

#[test]
fn test_replay_restores_index() {
    let temp = TempDir::new().unwrap();
    write_puts(temp.path(), 5);

    let (store, recovery) = LogStore::open(temp.path(), None).unwrap();

    assert_eq!(recovery.entries_recovered, 5);
    assert_eq!(recovery.last_lsn, 5);
    assert_eq!(store.keys().len(), 5);
    assert_eq!(store.get("key3"), Some(&b"entry3"[..]));
}

#[test]
fn test_replay_applies_deletes() {
    let temp = TempDir::new().unwrap();
    {
        let (mut store, _) = LogStore::open(temp.path(), None).unwrap();
        store.put("a", b"1".to_vec()).unwrap();
        store.put("b", b"2".to_vec()).unwrap();
        store.delete("a").unwrap();
        store.put("b", b"3".to_vec()).unwrap();
    }

    let (store, recovery) = LogStore::open(temp.path(), None).unwrap();

    assert_eq!(recovery.entries_recovered, 4);
    assert_eq!(store.get("a"), None);
    assert_eq!(store.get("b"), Some(&b"3"[..]));
}

#[test]
fn test_lsn_continues_after_reopen() {
    let temp = TempDir::new().unwrap();
    write_puts(temp.path(), 3);
    {
        let (mut store, _) = LogStore::open(temp.path(), None).unwrap();
        store.put("more", b"x".to_vec()).unwrap();
    }

    let (_, recovery) = LogStore::open(temp.path(), None).unwrap();
    assert_eq!(recovery.last_lsn, 4);
}

#[test]
fn test_torn_tail_is_truncated() {
    let temp = TempDir::new().unwrap();
    write_puts(temp.path(), 3);
    let path = log_path(temp.path());
    let clean_len = fs::metadata(&path).unwrap().len();

    // Half a frame: a header promising more data than exists
    let frame = LogRecord::new(
        4,
        LogOp::Put {
            key: "torn".to_string(),
            entry: vec![7u8; 64],
        },
    )
    .encode()
    .unwrap();
    append_bytes(&path, &frame[..frame.len() / 2]);

    let (store, recovery) = LogStore::open(temp.path(), None).unwrap();

    assert!(recovery.was_truncated);
    assert_eq!(recovery.entries_recovered, 3);
    assert_eq!(store.get("torn"), None);
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
}

#[test]
fn test_corrupted_frame_is_skipped() {
    let temp = TempDir::new().unwrap();
    let path = log_path(temp.path());

    let good = LogRecord::new(
        1,
        LogOp::Put {
            key: "good".to_string(),
            entry: b"ok".to_vec(),
        },
    )
    .encode()
    .unwrap();
    let mut bad = LogRecord::new(
        2,
        LogOp::Put {
            key: "bad".to_string(),
            entry: b"flipped".to_vec(),
        },
    )
    .encode()
    .unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    let after = LogRecord::new(
        3,
        LogOp::Put {
            key: "after".to_string(),
            entry: b"still here".to_vec(),
        },
    )
    .encode()
    .unwrap();

    fs::write(&path, [&good[..], &bad[..], &after[..]].concat()).unwrap();

    let (store, recovery) = LogStore::open(temp.path(), None).unwrap();

    assert_eq!(recovery.entries_recovered, 2);
    assert_eq!(recovery.entries_corrupted, 1);
    assert_eq!(recovery.last_lsn, 3);
    assert_eq!(store.get("bad"), None);
    assert_eq!(store.get("after"), Some(&b"still here"[..]));
}

// =============================================================================
// Quota & Compaction Tests
// =============================================================================

#[test]
fn test_put_rejected_over_quota() {
    let temp = TempDir::new().unwrap();
    let (mut store, _) = LogStore::open(temp.path(), Some(64)).unwrap();

    store.put("small", vec![0u8; 10]).unwrap();
    let err = store.put("big", vec![0u8; 100]).unwrap_err();

    assert!(matches!(
        err,
        StashError::QuotaExceeded {
            backend: BackendKind::Transactional,
            ..
        }
    ));
    assert_eq!(store.get("big"), None);
    assert_eq!(store.usage().items, 1);
}

#[test]
fn test_overwrite_within_quota_counts_replaced_bytes() {
    let temp = TempDir::new().unwrap();
    let (mut store, _) = LogStore::open(temp.path(), Some(64)).unwrap();

    store.put("k", vec![0u8; 40]).unwrap();
    // 40 + 40 would exceed 64, but the old value is replaced
    store.put("k", vec![1u8; 40]).unwrap();

    assert_eq!(store.usage().bytes, 41);
}

#[test]
fn test_compact_keeps_live_records() {
    let temp = TempDir::new().unwrap();
    {
        let (mut store, _) = LogStore::open(temp.path(), None).unwrap();
        for round in 0..10 {
            store.put("hot", format!("v{}", round).into_bytes()).unwrap();
        }
        store.put("cold", b"c".to_vec()).unwrap();
        store.delete("cold").unwrap();

        let before = store.log_bytes();
        store.compact().unwrap();
        assert!(store.log_bytes() < before);
    }

    let (store, recovery) = LogStore::open(temp.path(), None).unwrap();
    assert_eq!(recovery.entries_recovered, 1);
    assert_eq!(store.keys(), vec!["hot".to_string()]);
    assert_eq!(store.get("hot"), Some(&b"v9"[..]));
}

#[test]
fn test_clear_empties_log() {
    let temp = TempDir::new().unwrap();
    {
        let (mut store, _) = LogStore::open(temp.path(), None).unwrap();
        store.put("a", b"1".to_vec()).unwrap();
        store.clear().unwrap();
        assert_eq!(store.log_bytes(), 0);
    }

    let (store, recovery) = LogStore::open(temp.path(), None).unwrap();
    assert_eq!(recovery.entries_recovered, 0);
    assert!(store.keys().is_empty());
}
