//! Keys and their canonical lookup identity.
//!
//! A key is either a flat string or a mapping. Mappings are canonicalized
//! (object keys sorted at every depth, compact JSON) before hashing, so two
//! mappings with the same entries in any insertion order share an identity.

use cas::Sha1Hash;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A lookup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Flat(String),
    Structured(BTreeMap<String, Value>),
}

impl Key {
    /// Build a structured key from `(name, value)` pairs.
    pub fn structured<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Key::Structured(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// The key as a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Flat(s) => Value::String(s.clone()),
            Key::Structured(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    /// Canonical serialized form.
    pub fn canonical(&self) -> String {
        canonical_json(&self.to_value())
    }

    /// Lookup identity: SHA-1 of the canonical form.
    pub fn hash(&self) -> Sha1Hash {
        Sha1Hash::from_data(self.canonical().as_bytes())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Flat(s) => write!(f, "{}", s),
            Key::Structured(_) => write!(f, "{}", self.canonical()),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Flat(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Flat(s)
    }
}

impl From<Value> for Key {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Key::Flat(s),
            Value::Object(map) => Key::Structured(map.into_iter().collect()),
            other => Key::Flat(canonical_json(&other)),
        }
    }
}

/// Compact JSON with object keys sorted recursively. Arrays keep their order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
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
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
