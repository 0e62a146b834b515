//! Deterministic query identity.
//!
//! A query id is `"q/"` followed by the first 16 hex characters of the
//! SHA-256 digest of the canonical JSON form of `{"config": .., "desc": ..}`.
//! Canonical JSON sorts object keys recursively and carries no whitespace,
//! so structurally equal descriptors hash equally regardless of key
//! insertion order.

use super::options::{QueryConfig, QueryDesc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of digest bytes kept in the id.
const ID_BYTES: usize = 8;

/// Stable identifier of a logical query.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(String);

impl QueryId {
    /// Compute the id of a `{desc, config}` pair.
    pub fn compute(desc: &QueryDesc, config: &QueryConfig) -> Self {
        #[derive(Serialize)]
        struct Identity<'a> {
            desc: &'a QueryDesc,
            config: &'a QueryConfig,
        }

        // Both halves are plain data; serialization cannot fail.
        let value = serde_json::to_value(Identity { desc, config }).unwrap_or(Value::Null);
        let mut canonical = String::new();
        write_canonical(&value, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        QueryId(format!("q/{}", hex::encode(&digest[..ID_BYTES])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({})", self.0)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize `value` with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
