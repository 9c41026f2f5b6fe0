//! Header metadata encoding for subprocess hand-off.
//!
//! Routes marked `forward_headers` pass the request headers to the target
//! executable as a single JSON object string in one argv element. Encoding
//! as JSON keeps the value lossless and round-trippable no matter which
//! shell-meaningful characters a client puts in a header, and handing it
//! over as a discrete argv element means no shell ever re-parses it.

use hyper::header::HeaderMap;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    /// Header value is not representable as text
    #[error("header '{name}' has a non-text value")]
    NonTextValue { name: String },

    /// Serialization to JSON failed
    #[error("failed to serialize header metadata: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The encoded form could not be parsed back
    #[error("failed to parse header metadata: {0}")]
    Parse(serde_json::Error),
}

/// Encode request headers as a single JSON object string.
///
/// Header names are already lowercased by hyper; values of repeated headers
/// are joined with `", "`. Rejects values that are not valid text rather
/// than silently mangling them.
pub fn encode(headers: &HeaderMap) -> Result<String, MetadataError> {
    let mut map = BTreeMap::new();

    for name in headers.keys() {
        let mut joined = String::new();
        for value in headers.get_all(name) {
            let text = value.to_str().map_err(|_| MetadataError::NonTextValue {
                name: name.as_str().to_string(),
            })?;
            if !joined.is_empty() {
                joined.push_str(", ");
            }
            joined.push_str(text);
        }
        map.insert(name.as_str().to_string(), joined);
    }

    encode_map(&map)
}

/// Encode an already-collected header mapping
pub fn encode_map(map: &BTreeMap<String, String>) -> Result<String, MetadataError> {
    Ok(serde_json::to_string(map)?)
}

/// Decode an encoded header mapping back into a map.
///
/// Inverse of [`encode_map`]: `decode(&encode_map(&m)?)? == m`.
pub fn decode(encoded: &str) -> Result<BTreeMap<String, String>, MetadataError> {
    serde_json::from_str(encoded).map_err(MetadataError::Parse)
}
