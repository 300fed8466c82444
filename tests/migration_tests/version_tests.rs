//! Tests for schema version parsing, ordering and pending selection

use stashkv::migration::{pending, Migration, SchemaVersion};

fn noop(version: SchemaVersion) -> Migration {
    Migration::new(version, format!("to {}", version), |_| Ok(()))
}

#[test]
fn test_parse_full_and_partial() {
    assert_eq!(SchemaVersion::parse("1.2.3").unwrap(), SchemaVersion::new(1, 2, 3));
    assert_eq!(SchemaVersion::parse("1.1").unwrap(), SchemaVersion::new(1, 1, 0));
    assert_eq!(SchemaVersion::parse("2").unwrap(), SchemaVersion::new(2, 0, 0));
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(SchemaVersion::parse("").unwrap_err().is_validation());
    assert!(SchemaVersion::parse("1.x").is_err());
    assert!(SchemaVersion::parse("1.2.3.4").is_err());
}

#[test]
fn test_numeric_ordering() {
    let v = |s: &str| SchemaVersion::parse(s).unwrap();

    assert!(v("1.10.0") > v("1.9.0"));
    assert!(v("0.9.9") < v("1.0.0"));
    assert_eq!(v("1.1"), v("1.1.0"));
}

#[test]
fn test_display_and_serde() {
    let version = SchemaVersion::new(1, 4, 0);

    assert_eq!(version.to_string(), "1.4.0");
    assert_eq!(serde_json::to_string(&version).unwrap(), "\"1.4.0\"");
    assert_eq!(
        serde_json::from_str::<SchemaVersion>("\"1.4\"").unwrap(),
        version
    );
}

#[test]
fn test_pending_selects_half_open_range_in_order() {
    let migrations = vec![
        noop(SchemaVersion::new(1, 1, 0)),
        noop(SchemaVersion::new(0, 5, 0)),
        noop(SchemaVersion::new(1, 2, 0)),
        noop(SchemaVersion::new(1, 0, 0)),
    ];

    let steps = pending(&migrations, SchemaVersion::new(0, 9, 0), SchemaVersion::new(1, 1, 0));
    let versions: Vec<String> = steps.iter().map(|m| m.version.to_string()).collect();

    assert_eq!(versions, vec!["1.0.0", "1.1.0"]);
}

#[test]
fn test_pending_is_empty_when_current() {
    let migrations = vec![noop(SchemaVersion::new(1, 0, 0))];

    assert!(pending(&migrations, SchemaVersion::new(1, 0, 0), SchemaVersion::new(1, 0, 0)).is_empty());
}
