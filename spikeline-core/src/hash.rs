//! Canonical content hashing for parameter deduplication
//!
//! Two payloads that are semantically equal must hash identically, so the
//! JSON is serialized in a canonical form first: object keys sorted
//! recursively, no whitespace, numbers in serde_json's shortest form. The
//! SHA-256 digest is truncated to 16 bytes and carried as a [`Uuid`] so it
//! fits a plain TEXT column and prints compactly in logs.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::key::EntityKey;

/// Hash a JSON payload into a 128-bit content id.
pub fn content_hash(payload: &serde_json::Value) -> Uuid {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Hash an entity name plus key into the job-queue row id.
///
/// The entity name is folded in so the same key values under two different
/// entities never collide.
pub fn key_hash(entity: &str, key: &EntityKey) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(entity.as_bytes());
    for (name, value) in key.attrs() {
        hasher.update(b"\x1f");
        hasher.update(name.as_bytes());
        hasher.update(b"\x1e");
        hasher.update(value.canonical().as_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => out.push_str(&n.to_string()),
        serde_json::Value::String(s) => write_escaped(s, out),
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            // Sort explicitly rather than trusting the map's iteration order
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
