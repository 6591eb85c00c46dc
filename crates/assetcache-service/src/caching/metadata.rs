//! The metadata record stored next to each cached asset.
//!
//! Only the current format is ever written. Older formats are recognized by [`decode_legacy`],
//! which is kept free of any I/O and tried before the current format.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ContentType;

use super::CacheError;

/// Bookkeeping about one cached asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// When the contents were fetched.
    #[serde(rename = "cachedAt", with = "chrono::serde::ts_milliseconds")]
    pub cached_at: DateTime<Utc>,
    /// How the contents are stored.
    #[serde(rename = "type", default)]
    pub content_type: ContentType,
    /// Free form extra information, such as the status and headers of an HTTP response.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Metadata {
    pub fn new(content_type: ContentType, metadata: Map<String, Value>) -> Self {
        Self {
            cached_at: Utc::now(),
            content_type,
            metadata,
        }
    }
}

/// A decoded metadata file.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub metadata: Metadata,
    /// Contents stored inline by older versions.
    pub embedded: Option<Value>,
}

/// Decodes a metadata file, accepting every format that was ever written.
pub fn decode_record(bytes: &[u8]) -> Result<StoredRecord, CacheError> {
    let value: Value = serde_json::from_slice(bytes)?;
    if let Some(record) = decode_legacy(&value) {
        return Ok(record);
    }

    Ok(StoredRecord {
        metadata: serde_json::from_value(value)?,
        embedded: None,
    })
}

/// Serializes a record in the current format.
pub fn encode_record(metadata: &Metadata) -> Result<Vec<u8>, CacheError> {
    Ok(serde_json::to_vec(metadata)?)
}

/// Recognizes the legacy formats:
///
/// - a record with its `contents` inlined next to `cachedAt` and `type`,
/// - a map with a single entry, keyed by the cache key, wrapping either kind of record.
///
/// Returns `None` for anything else, including the current format.
pub fn decode_legacy(value: &Value) -> Option<StoredRecord> {
    let object = value.as_object()?;

    if object.contains_key("cachedAt") {
        let embedded = object.get("contents")?.clone();
        let metadata = record_metadata(object)?;
        return Some(StoredRecord {
            metadata,
            embedded: Some(embedded),
        });
    }

    if object.len() != 1 {
        return None;
    }
    let inner = object.values().next()?.as_object()?;
    if !inner.contains_key("cachedAt") {
        return None;
    }

    Some(StoredRecord {
        metadata: record_metadata(inner)?,
        embedded: inner.get("contents").cloned(),
    })
}

fn record_metadata(object: &Map<String, Value>) -> Option<Metadata> {
    let mut object = object.clone();
    object.remove("contents");
    serde_json::from_value(Value::Object(object)).ok()
}
