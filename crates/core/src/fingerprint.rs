use std::fmt;

use serde_json::Value;

use crate::Row;

/// blake3 digest of a payload. Object keys are fed in sorted order, so
/// equal payloads hash equally whatever their insertion order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadHash([u8; 32]);

fn feed(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"n");
        }
        Value::Bool(b) => {
            hasher.update(if *b { b"t" } else { b"f" });
        }
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(&(s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update(&(items.len() as u64).to_be_bytes());
            for item in items {
                feed(hasher, item);
            }
        }
        Value::Object(map) => feed_object(hasher, map),
    }
}

fn feed_object(hasher: &mut blake3::Hasher, map: &Row) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    hasher.update(b"{");
    hasher.update(&(keys.len() as u64).to_be_bytes());
    for key in keys {
        hasher.update(&(key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        feed(hasher, &map[key.as_str()]);
    }
}

impl PayloadHash {
    pub fn of(payload: &Row) -> Self {
        let mut hasher = blake3::Hasher::new();
        feed_object(&mut hasher, payload);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadHash({:02x}{:02x}...)", self.0[0], self.0[1])
    }
}
