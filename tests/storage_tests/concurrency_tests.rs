//! Tests for concurrent access through a shared Storage
//!
//! These tests verify:
//! - Read-modify-write conveniences never lose updates
//! - Concurrent writers leave cache and backend agreeing
//! - List and set removals never recreate a key removed under them

use std::sync::Arc;
use std::thread;

use serde_json::json;
use stashkv::{Config, GetOptions, Storage};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const THREADS: usize = 8;
const ROUNDS: usize = 50;

fn shared_storage() -> (TempDir, Arc<Storage>) {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(
        Config::builder()
            .data_dir(temp.path())
            .background_maintenance(false)
            .build(),
    );
    (temp, Arc::new(storage))
}

fn run_threads<F>(storage: &Arc<Storage>, work: F)
where
    F: Fn(&Storage, usize) + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let storage = Arc::clone(storage);
            let work = Arc::clone(&work);
            thread::spawn(move || work(&storage, t))
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_increments_are_not_lost() {
    let (_temp, storage) = shared_storage();

    run_threads(&storage, |storage, _| {
        for _ in 0..ROUNDS {
            storage.increment("counter", 1).unwrap();
        }
    });

    let expected = (THREADS * ROUNDS) as i64;
    assert_eq!(storage.get("counter").unwrap(), Some(json!(expected)));
    assert_eq!(
        storage
            .get_with("counter", &GetOptions::default().skip_cache())
            .unwrap(),
        Some(json!(expected))
    );
}

#[test]
fn test_concurrent_pushes() {
    let (_temp, storage) = shared_storage();

    run_threads(&storage, |storage, t| {
        for i in 0..ROUNDS {
            storage.push("log", &format!("{}-{}", t, i)).unwrap();
        }
    });

    let list = storage.get("log").unwrap().unwrap();
    assert_eq!(list.as_array().unwrap().len(), THREADS * ROUNDS);
}

#[test]
fn test_concurrent_writers_agree_with_backend() {
    let (_temp, storage) = shared_storage();

    run_threads(&storage, |storage, t| {
        for i in 0..ROUNDS {
            storage.set("shared", &json!({"writer": t, "round": i})).unwrap();
        }
    });

    let cached = storage.get("shared").unwrap();
    let persisted = storage
        .get_with("shared", &GetOptions::default().skip_cache())
        .unwrap();
    assert!(cached.is_some());
    assert_eq!(cached, persisted);
}

#[test]
fn test_concurrent_distinct_keys() {
    let (_temp, storage) = shared_storage();

    run_threads(&storage, |storage, t| {
        for i in 0..ROUNDS {
            storage.set(&format!("k_{}_{}", t, i), &i).unwrap();
        }
    });

    assert_eq!(storage.keys().unwrap().len(), THREADS * ROUNDS);
    assert_eq!(storage.get("k_3_17").unwrap(), Some(json!(17)));
}

#[test]
fn test_pop_racing_remove_never_recreates_key() {
    for round in 0..20 {
        let (_temp, storage) = shared_storage();
        let items: Vec<usize> = (0..ROUNDS).collect();
        storage.set("queue", &items).unwrap();

        let poppers: Vec<_> = (0..THREADS)
            .map(|_| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || while storage.pop("queue").unwrap().is_some() {})
            })
            .collect();
        storage.remove("queue").unwrap();
        for popper in poppers {
            popper.join().unwrap();
        }

        assert!(!storage.has("queue").unwrap(), "queue recreated in round {}", round);
    }
}

#[test]
fn test_remove_member_racing_remove_never_recreates_key() {
    for round in 0..20 {
        let (_temp, storage) = shared_storage();
        let members: Vec<String> = (0..THREADS).map(|t| format!("m{}", t)).collect();
        storage.set("tags", &members).unwrap();

        let removers: Vec<_> = (0..THREADS)
            .map(|t| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || storage.remove_member("tags", &format!("m{}", t)).unwrap())
            })
            .collect();
        storage.remove("tags").unwrap();
        for remover in removers {
            remover.join().unwrap();
        }

        assert!(!storage.has("tags").unwrap(), "tags recreated in round {}", round);
    }
}
