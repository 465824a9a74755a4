// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Payload codec with threshold-based block compression.
//!
//! Blobs are canonical JSON bytes behind a one-byte framing marker. Payloads
//! larger than the threshold are zstd-compressed. Blobs without a marker
//! (legacy rows) are treated as bare JSON.

use serde_json::Value;
use thiserror::Error;

/// Marker for an uncompressed JSON body.
const MARKER_PLAIN: u8 = 0x00;

/// Marker for a zstd-compressed JSON body.
const MARKER_COMPRESSED: u8 = 0x01;

/// Payloads at or below this size are stored uncompressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// zstd level 3 is a good balance of speed and compression
const COMPRESSION_LEVEL: i32 = 3;

/// Errors from blob encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compress(String),
    #[error("malformed blob: {0}")]
    Malformed(String),
}

/// Encode a payload into a marked blob, compressing above `threshold`.
pub fn encode(payload: &Value, threshold: usize) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(payload)?;

    if json.len() > threshold {
        let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
            .map_err(|e| CodecError::Compress(e.to_string()))?;
        let mut blob = Vec::with_capacity(compressed.len() + 1);
        blob.push(MARKER_COMPRESSED);
        blob.extend_from_slice(&compressed);
        Ok(blob)
    } else {
        let mut blob = Vec::with_capacity(json.len() + 1);
        blob.push(MARKER_PLAIN);
        blob.extend_from_slice(&json);
        Ok(blob)
    }
}

/// Decode a blob produced by [`encode`].
///
/// JSON text never begins with the marker bytes, so blobs lacking a marker
/// decode as bare JSON.
pub fn decode(blob: &[u8]) -> Result<Value, CodecError> {
    let Some((&marker, body)) = blob.split_first() else {
        return Err(CodecError::Malformed("empty blob".to_string()));
    };

    match marker {
        MARKER_COMPRESSED => {
            let json = zstd::decode_all(body)
                .map_err(|e| CodecError::Malformed(format!("bad zstd frame: {e}")))?;
            Ok(serde_json::from_slice(&json)?)
        }
        MARKER_PLAIN => Ok(serde_json::from_slice(body)?),
        _ => Ok(serde_json::from_slice(blob)?),
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
