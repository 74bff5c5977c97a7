//! Canonical encoding and checksums for entity snapshots
//!
//! Two payloads with the same logical content must hash identically, so the
//! checksum never depends on map ordering: volatile fields are stripped at every
//! depth, then the value is written with sorted keys and fixed separators
//! before hashing with SHA-256.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Fields that change without any human edit (view tracking, computed links,
/// optimistic lock counters) and must not affect change detection.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &[
    "_links",
    "lastViewedAt",
    "last_viewed_at",
    "updatedAt",
    "updated_at",
    "lockVersion",
    "lock_version",
];

/// Set of field names stripped before checksumming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolatileFields {
    fields: BTreeSet<String>,
}

impl VolatileFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }
}

impl Default for VolatileFields {
    fn default() -> Self {
        Self::new(DEFAULT_VOLATILE_FIELDS.iter().copied())
    }
}

/// Remove volatile fields from every object in `data`
pub fn normalize(data: &Value, volatile: &VolatileFields) -> Value {
    match data {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !volatile.contains(key))
                .map(|(key, value)| (key.clone(), normalize(value, volatile)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| normalize(v, volatile)).collect()),
        other => other.clone(),
    }
}

/// Serialize `value` with sorted object keys and `,`/`:` separators
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

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
        // Scalars have a single JSON rendering
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 (hex) of the normalized canonical encoding of `data`
pub fn checksum(data: &Value, volatile: &VolatileFields) -> String {
    let canonical = canonical_json(&normalize(data, volatile));

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}
