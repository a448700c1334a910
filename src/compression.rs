//! LZ4 compression for cache payloads
//!
//! Cached payloads can be transparently compressed before they reach the
//! shared tier. LZ4 is fast enough that compression never dominates a cache
//! write. Decoding is forgiving: a payload that fails to decompress is
//! retried as raw JSON, and a payload that fails both ways is a cache miss,
//! never an error.

use serde_json::Value;
use std::io::{self, Read, Write};

/// Compress a payload at LZ4's fastest level. Cache writes happen on the
/// hot path, so speed wins over ratio.
pub fn compress_lz4(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = lz4::EncoderBuilder::new().level(1).build(Vec::new())?;
    encoder.write_all(data)?;
    let (buffer, outcome) = encoder.finish();
    outcome?;
    Ok(buffer)
}

/// Inverse of [`compress_lz4`]. Fails on anything that is not an LZ4 frame.
pub fn decompress_lz4(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    lz4::Decoder::new(data)?.read_to_end(&mut raw)?;
    Ok(raw)
}

/// Encode a JSON payload for shared-tier storage
pub fn encode_payload(value: &Value, compress: bool) -> io::Result<Vec<u8>> {
    let raw = serde_json::to_vec(value)?;
    if compress {
        compress_lz4(&raw)
    } else {
        Ok(raw)
    }
}

/// Decode a shared-tier payload back into JSON.
///
/// Tries LZ4 first, falls back to a raw parse, and returns `None` when both
/// fail. The caller treats that as a miss.
pub fn decode_payload(data: &[u8]) -> Option<Value> {
    if let Ok(raw) = decompress_lz4(data) {
        if let Ok(value) = serde_json::from_slice(&raw) {
            return Some(value);
        }
    }
    serde_json::from_slice(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lz4_round_trip() {
        let data = b"Hello, ward 7! ".repeat(100);
        let compressed = compress_lz4(&data).unwrap();
        assert!(compressed.len() < data.len());

        let decompressed = decompress_lz4(&compressed).unwrap();
        assert_eq!(data.to_vec(), decompressed);
    }

    #[test]
    fn test_payload_round_trip_compressed() {
        let value = json!({
            "id": "D1",
            "name": "Dr. Okafor",
            "departments": ["cardiology", "icu"]
        });

        let encoded = encode_payload(&value, true).unwrap();
        let decoded = decode_payload(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_payload_round_trip_uncompressed() {
        let value = json!({"rooms": [101, 102, 103]});
        let encoded = encode_payload(&value, false).unwrap();
        let decoded = decode_payload(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_decode_falls_back_to_raw_json() {
        // Plain JSON written by an instance with compression disabled must
        // still decode on an instance with compression enabled.
        let raw = serde_json::to_vec(&json!({"plain": true})).unwrap();
        let decoded = decode_payload(&raw).unwrap();
        assert_eq!(decoded, json!({"plain": true}));
    }

    #[test]
    fn test_decode_garbage_is_none() {
        assert!(decode_payload(&[0xde, 0xad, 0xbe, 0xef]).is_none());
        assert!(decode_payload(b"").is_none());
    }

    #[test]
    fn test_unicode_payload() {
        let value = json!({"note": "患者は安定しています 🏥"});
        let encoded = encode_payload(&value, true).unwrap();
        assert_eq!(decode_payload(&encoded).unwrap(), value);
    }
}
