//! Stored records and the write operations applied to them.
//!
//! The same [`KvOp`] vocabulary is applied by the local store under its
//! file lock and carried over the wire to share servers, so local and
//! remote writes have identical semantics.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::crypto::{self, SealedValue};
use crate::error::KvError;
use crate::key::Key;

/// Reserved subkey meaning "all subkeys".
pub const CLEAR_SUBKEY: &str = "-";

/// The payload stored for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ValueRecord {
    Value(Value),
    Sealed(SealedValue),
    /// Sparse dictionary of named parts; entries are `Value` or `Sealed`.
    SubKeys(BTreeMap<String, ValueRecord>),
}

impl ValueRecord {
    /// Build a record, sealing it when a password is given.
    pub fn new(value: Value, password: Option<&str>) -> Result<Self, KvError> {
        match password {
            Some(p) => Ok(ValueRecord::Sealed(crypto::seal(&value, p)?)),
            None => Ok(ValueRecord::Value(value)),
        }
    }

    /// Read the record back.
    ///
    /// Returns `None` when the password doesn't fit the record: a sealed
    /// record without the right password, or a plain record read with one.
    /// A subkey dictionary opens to an object of the parts that do open.
    pub fn open(&self, password: Option<&str>) -> Option<Value> {
        match (self, password) {
            (ValueRecord::Value(v), None) => Some(v.clone()),
            (ValueRecord::Value(_), Some(_)) => None,
            (ValueRecord::Sealed(sealed), Some(p)) => crypto::open(sealed, p),
            (ValueRecord::Sealed(_), None) => None,
            (ValueRecord::SubKeys(parts), password) => Some(Value::Object(
                parts
                    .iter()
                    .filter_map(|(k, r)| r.open(password).map(|v| (k.clone(), v)))
                    .collect::<Map<String, Value>>(),
            )),
        }
    }

    pub fn subkey(&self, subkey: &str) -> Option<&ValueRecord> {
        match self {
            ValueRecord::SubKeys(parts) => parts.get(subkey),
            _ => None,
        }
    }

    pub fn subkey_names(&self) -> BTreeSet<String> {
        match self {
            ValueRecord::SubKeys(parts) => parts.keys().cloned().collect(),
            _ => BTreeSet::new(),
        }
    }
}

/// What is persisted on disk for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: Key,
    pub record: ValueRecord,
}

/// A write against one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvOp {
    /// Unconditional overwrite; `None` deletes.
    Set { record: Option<ValueRecord> },
    /// Claim: write only if nothing is stored.
    SetIfAbsent { record: ValueRecord },
    /// Write only if the current record equals `expected` (`None` = absent).
    CompareAndSet {
        expected: Option<ValueRecord>,
        record: Option<ValueRecord>,
    },
    /// Set or remove one subkey; a non-dictionary record is replaced.
    SetSubKey {
        subkey: String,
        record: Option<ValueRecord>,
    },
    /// Remove all subkeys (the entry itself goes away).
    ClearSubKeys,
}

impl KvOp {
    /// Translate a subkey write, handling the reserved `'-'` subkey.
    pub fn subkey(subkey: &str, record: Option<ValueRecord>) -> Result<Self, KvError> {
        if subkey == CLEAR_SUBKEY {
            return match record {
                None => Ok(KvOp::ClearSubKeys),
                Some(_) => Err(KvError::ReservedSubKey(subkey.to_string())),
            };
        }
        Ok(KvOp::SetSubKey {
            subkey: subkey.to_string(),
            record,
        })
    }

    /// Apply to the current record.
    ///
    /// Returns whether the operation took effect and the resulting record.
    pub fn apply(self, current: Option<ValueRecord>) -> (bool, Option<ValueRecord>) {
        match self {
            KvOp::Set { record } => (true, record),
            KvOp::SetIfAbsent { record } => match current {
                None => (true, Some(record)),
                Some(existing) => (false, Some(existing)),
            },
            KvOp::CompareAndSet { expected, record } => {
                if current == expected {
                    (true, record)
                } else {
                    (false, current)
                }
            }
            KvOp::SetSubKey { subkey, record } => {
                let mut parts = match current {
                    Some(ValueRecord::SubKeys(parts)) => parts,
                    _ => BTreeMap::new(),
                };
                match record {
                    Some(r) => {
                        parts.insert(subkey, r);
                    }
                    None => {
                        parts.remove(&subkey);
                    }
                }
                if parts.is_empty() {
                    (true, None)
                } else {
                    (true, Some(ValueRecord::SubKeys(parts)))
                }
            }
            KvOp::ClearSubKeys => (true, None),
        }
    }
}
