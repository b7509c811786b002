//! Content hashing - stable joinable keys for messages
//!
//! Two messages with identical (role, normalized content) share a hash, so
//! context cards and compressed context representations can always be joined
//! back to the full originals in the sink.

use sha2::{Digest, Sha256};

/// Normalize content before hashing
///
/// CRLF is folded to LF and trailing whitespace is stripped per line, so a
/// message round-tripped through storage or a terminal hashes identically.
pub fn normalize(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Stable 16-hex content hash over (role, normalized content)
pub fn content_hash(role: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(role.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize(content).as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Hash a structured content value
///
/// Non-string values are hashed over their canonical JSON encoding
/// (serde_json orders object keys, so encoding is deterministic).
pub fn content_hash_value(role: &str, content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => content_hash(role, s),
        other => content_hash(role, &other.to_string()),
    }
}
