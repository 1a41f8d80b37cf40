//! Encoding of per-entity state stored on the control plane.
//!
//! State blobs are gzip-compressed then base64-encoded so they fit in a
//! service label. Older deployments stored the compiled slice as plain text,
//! so decoding falls back to returning the input unchanged.

use crate::error::{DsppError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Encode compiled state for storage.
///
/// Process:
/// 1. Compress with gzip
/// 2. Encode as base64 (standard alphabet, padded)
pub fn encode(text: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(text.as_bytes()).map_err(|e| DsppError::SerializeFailed {
        reason: format!("Failed to compress state: {}", e),
    })?;
    let compressed = encoder.finish().map_err(|e| DsppError::SerializeFailed {
        reason: format!("Failed to finish compression: {}", e),
    })?;

    Ok(STANDARD.encode(compressed))
}

fn try_decode(blob: &str) -> Option<String> {
    let compressed = STANDARD.decode(blob.trim()).ok()?;
    let mut text = String::new();
    GzDecoder::new(compressed.as_slice()).read_to_string(&mut text).ok()?;
    Some(text)
}

/// Decode stored state. Never fails: anything that does not decompress is legacy plain text.
pub fn decode(blob: &str) -> String {
    try_decode(blob).unwrap_or_else(|| blob.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLICE: &str = "# app @1a2b3 (dspp v0.4.0)\nservices:\n  web:\n    image: nginx\n";

    #[test]
    fn test_round_trip() {
        let encoded = encode(SLICE).unwrap();
        assert_ne!(encoded, SLICE);
        assert!(!encoded.contains('\n'));
        assert_eq!(decode(&encoded), SLICE);
    }

    #[test]
    fn test_legacy_plain_text() {
        assert_eq!(decode(SLICE), SLICE);
        assert_eq!(decode(""), "");
    }

    #[test]
    fn test_base64_that_is_not_gzip() {
        // Valid base64, but not a gzip stream.
        assert_eq!(decode("aGVsbG8="), "aGVsbG8=");
    }

    #[test]
    fn test_empty_text_round_trip() {
        assert_eq!(decode(&encode("").unwrap()), "");
    }
}
