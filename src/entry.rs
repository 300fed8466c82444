//! Entry definitions
//!
//! Defines the persisted unit and the shape its value takes once it has
//! been through the compression and encryption stages.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::SealedBox;
use crate::error::Result;

/// A single persisted entry, as written to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Physical key (prefix + logical key)
    pub key: String,

    /// The value, possibly packed and/or sealed
    pub value: StoredValue,

    /// Timestamp (unix millis) when the entry was created
    pub timestamp: u64,

    /// Caller-supplied type tag, or the JSON kind of the value
    #[serde(rename = "type")]
    pub value_type: String,

    pub metadata: EntryMetadata,

    #[serde(default)]
    pub encrypted: bool,

    #[serde(default)]
    pub compressed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
}

/// The stored form of an entry value
///
/// `Plain` holds the JSON value untouched. `Packed` holds DEFLATE output
/// of the serialized value. `Sealed` holds AES-GCM output of either of
/// the former (serialized JSON, or packed bytes when `compressed` is set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "snake_case")]
pub enum StoredValue {
    Plain(Value),
    Packed(#[serde(with = "base64_bytes")] Vec<u8>),
    Sealed(SealedBox),
}

/// Entry metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
    pub schema_version: String,

    /// Caller-supplied metadata
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EntryMetadata {
    /// Fresh metadata stamped with the current time
    pub fn new(schema_version: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            created: now,
            modified: now,
            accessed: now,
            schema_version: schema_version.into(),
            extra: Map::new(),
        }
    }
}

impl StoredEntry {
    /// Serialize to the JSON text used by the string-typed media
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON text produced by `to_json`
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Approximate footprint on a medium (serialized size in bytes)
    pub fn encoded_len(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }
}

/// JSON kind name used as the default entry type
pub fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Current wall clock time in unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serde adapter storing byte buffers as base64 text
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
