//! JSON bodies exchanged with a share server.
//!
//! ```text
//! GET  /kv/{collection}/{key_hash}     -> KvRecordResponse | 404
//! POST /kv/{collection}/{key_hash}     KvWriteRequest -> KvWriteResponse
//! HEAD /blobs/{collection}/{sha1}      -> 200 (content-length) | 404
//! GET  /blobs/{collection}/{sha1}      -> bytes | 404
//! PUT  /blobs/{collection}/{sha1}      bytes -> 204
//! GET  /health                         -> HealthResponse
//! ```
//!
//! Reads need the read token when the server has one configured, writes
//! need the write token. Both travel as `Authorization: Bearer ...`.

use kvstore::{Key, KvOp, ValueRecord};
use serde::{Deserialize, Serialize};

/// Blob size on `HEAD /blobs/...`; bodiless responses can't be trusted
/// to keep `content-length`.
pub const BLOB_SIZE_HEADER: &str = "x-blob-size";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvRecordResponse {
    pub record: ValueRecord,
}

/// A key/value write. The op fields sit next to `key`:
/// `{"key": {...}, "op": "set_if_absent", "record": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvWriteRequest {
    pub key: Key,
    #[serde(flatten)]
    pub op: KvOp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KvWriteResponse {
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_request_is_flat() {
        let request = KvWriteRequest {
            key: json!({"job": 1}).into(),
            op: KvOp::SetIfAbsent {
                record: ValueRecord::Value(json!("mine")),
            },
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["op"], "set_if_absent");
        assert_eq!(body["key"], json!({"job": 1}));
        assert_eq!(body["record"]["data"], "mine");

        let parsed: KvWriteRequest = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.op, request.op);
        assert_eq!(parsed.key.hash(), request.key.hash());
    }
}
