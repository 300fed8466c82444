//! Tests for backend error classification
//!
//! These tests verify:
//! - Medium failures are classified as backend failures
//! - Caller and codec mistakes are not

use std::io;

use stashkv::backend::BackendKind;
use stashkv::StashError;

#[test]
fn test_medium_failures_are_backend_failures() {
    let failures = [
        StashError::Io(io::Error::new(io::ErrorKind::Other, "disk gone")),
        StashError::Storage("snapshot unreadable".to_string()),
        StashError::BackendUnavailable(BackendKind::Durable),
        StashError::BackendTimeout(BackendKind::Transactional),
        StashError::QuotaExceeded {
            backend: BackendKind::Session,
            needed: 10,
            quota: 5,
        },
    ];

    for err in &failures {
        assert!(err.is_backend_failure(), "{} should be a backend failure", err);
        assert!(!err.is_validation());
    }
}

#[test]
fn test_other_errors_are_not_backend_failures() {
    let others = [
        StashError::Validation("empty key".to_string()),
        StashError::Crypto("tag mismatch".to_string()),
        StashError::Compression("bad stream".to_string()),
        StashError::Serialization("not json".to_string()),
        StashError::NoBackendAvailable,
        StashError::Config("inverted ratios".to_string()),
        StashError::Migration {
            version: "1.0.0".to_string(),
            reason: "boom".to_string(),
        },
    ];

    for err in &others {
        assert!(!err.is_backend_failure(), "{} should not be a backend failure", err);
    }
}
