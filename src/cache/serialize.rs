//! Value serialization for the secure cache.
//!
//! The primary wire format is JSON. Byte-array values travel inside a
//! sentinel object so they survive the JSON round trip, and traversal deeper
//! than the depth guard is replaced with the literal string `"[Circular]"`
//! (the closest analogue of circular-reference detection for a tree-shaped
//! value model; documented lossy behavior).

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value as JsonValue};

use crate::core::{XyPrissError, XyResult};

/// Sentinel key marking a byte-array value.
const BYTES_SENTINEL: &str = "__xypriss_bytes__";

/// Replacement for graph slices beyond the depth guard.
const CIRCULAR_SENTINEL: &str = "[Circular]";

/// Maximum traversal depth before the circular sentinel kicks in.
const MAX_DEPTH: usize = 128;

/// Strings longer than this pass through untouched by normalization.
const LONG_STRING_LIMIT: usize = 1024 * 1024;

/// Wraps raw bytes into the sentinel JSON form.
pub fn bytes_value(bytes: &[u8]) -> JsonValue {
    let mut map = Map::new();
    map.insert(
        BYTES_SENTINEL.to_string(),
        JsonValue::String(BASE64.encode(bytes)),
    );
    JsonValue::Object(map)
}

/// Unwraps a sentinel byte value, if the JSON value is one.
pub fn value_as_bytes(value: &JsonValue) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let encoded = obj.get(BYTES_SENTINEL)?.as_str()?;
    BASE64.decode(encoded).ok()
}

/// Serializes a value to bytes, applying the depth guard.
pub fn serialize(value: &JsonValue) -> XyResult<Vec<u8>> {
    let normalized = normalize(value, 0);
    serde_json::to_vec(&normalized)
        .map_err(|e| XyPrissError::CacheSerialization(e.to_string()))
}

/// Deserializes bytes back into a JSON value.
pub fn deserialize(bytes: &[u8]) -> XyResult<JsonValue> {
    serde_json::from_slice(bytes).map_err(|e| XyPrissError::CacheSerialization(e.to_string()))
}

fn normalize(value: &JsonValue, depth: usize) -> JsonValue {
    if depth > MAX_DEPTH {
        log::debug!("serialization depth guard hit, substituting circular sentinel");
        return JsonValue::String(CIRCULAR_SENTINEL.to_string());
    }
    match value {
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| normalize(v, depth + 1)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v, depth + 1)))
                .collect(),
        ),
        JsonValue::String(s) if s.len() > LONG_STRING_LIMIT => {
            // Oversized strings pass through unchanged.
            JsonValue::String(s.clone())
        }
        other => other.clone(),
    }
}

/// Gzip-compresses serialized bytes at the given level (1-9).
pub fn compress(data: &[u8], level: u32) -> XyResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.clamp(1, 9)));
    encoder
        .write_all(data)
        .map_err(|e| XyPrissError::CacheSerialization(format!("compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| XyPrissError::CacheSerialization(format!("compression failed: {e}")))
}

/// Inverse of [`compress`].
pub fn decompress(data: &[u8]) -> XyResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| XyPrissError::CacheSerialization(format!("decompression failed: {e}")))?;
    Ok(out)
}
