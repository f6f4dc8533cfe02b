// hasher.rs: SHA-256 hashing and canonical JSON encoding.
//
// All hashes in Warden are SHA-256, hex-encoded. Record hashes and
// signatures are computed over the *canonical* encoding of a value: the
// value is first converted to a `serde_json::Value` (whose maps keep their
// keys sorted) and then written compactly. Re-encoding a parsed record
// therefore reproduces the exact bytes that were hashed. Floats included:
// the workspace enables serde_json's `float_roundtrip` parser.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    format!("{:x}", result)
}

/// Hash a UTF-8 string, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Encode a value with stable (sorted) field ordering and no whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}
