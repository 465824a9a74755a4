// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

#[test]
fn small_payload_stays_uncompressed() {
    let payload = json!({ "k": "v" });
    let blob = encode(&payload, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
    assert_eq!(blob[0], 0x00);
    assert_eq!(decode(&blob).unwrap(), payload);
}

#[test]
fn large_payload_is_compressed() {
    let payload = json!({ "blob": "x".repeat(10_000) });
    let blob = encode(&payload, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
    assert_eq!(blob[0], 0x01);
    // Highly repetitive data must actually shrink.
    assert!(blob.len() < 10_000);
    assert_eq!(decode(&blob).unwrap(), payload);
}

#[yare::parameterized(
    null    = { json!(null) },
    number  = { json!(42.5) },
    array   = { json!([1, 2, 3]) },
    nested  = { json!({ "a": { "b": [true, "s", null] } }) },
)]
fn roundtrip_is_identity(payload: serde_json::Value) {
    let blob = encode(&payload, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
    assert_eq!(decode(&blob).unwrap(), payload);
}

#[test]
fn roundtrip_at_exact_threshold_boundary() {
    // Serialized size lands just above a tiny threshold: compressed path.
    let payload = json!({ "k": "0123456789" });
    let blob = encode(&payload, 4).unwrap();
    assert_eq!(blob[0], 0x01);
    assert_eq!(decode(&blob).unwrap(), payload);

    // At or below threshold: plain path.
    let serialized = serde_json::to_vec(&payload).unwrap();
    let blob = encode(&payload, serialized.len()).unwrap();
    assert_eq!(blob[0], 0x00);
    assert_eq!(decode(&blob).unwrap(), payload);
}

#[test]
fn legacy_blob_without_marker_decodes_as_json() {
    let raw = b"{\"legacy\":true}";
    assert_eq!(decode(raw).unwrap(), json!({ "legacy": true }));
}

#[test]
fn empty_blob_is_malformed() {
    assert!(matches!(decode(&[]), Err(CodecError::Malformed(_))));
}

#[test]
fn corrupt_compressed_frame_is_malformed() {
    let blob = [0x01, 0xde, 0xad, 0xbe, 0xef];
    assert!(matches!(decode(&blob), Err(CodecError::Malformed(_))));
}
