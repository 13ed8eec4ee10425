//! Local key/value storage for mountaintools.
//!
//! Keys are flat strings or JSON mappings, canonicalized before hashing.
//! Values are small JSON documents, optionally sealed with a password or
//! split into named subkeys. Writes go through [`KvOp`]s applied under a
//! per-key exclusive file lock, which makes [`LocalKvStore::set_if_absent`]
//! a true claim primitive across processes sharing the same disk.
//!
//! ```rust,no_run
//! use kvstore::{Key, LocalKvStore};
//! use serde_json::json;
//!
//! let kv = LocalKvStore::open("/data/mountaintools/kv").unwrap();
//! let key: Key = json!({"study": "synth", "recording": 3}).into();
//!
//! kv.set(&key, None, Some(json!("sha1://...")), None).unwrap();
//! let claimed = kv.set_if_absent(&Key::from("job-17"), json!({"worker": "a"})).unwrap();
//! ```

pub mod crypto;
pub mod error;
pub mod key;
pub mod record;
pub mod store;

pub use crypto::SealedValue;
pub use error::KvError;
pub use key::{canonical_json, Key};
pub use record::{KvOp, StoredEntry, ValueRecord, CLEAR_SUBKEY};
pub use store::LocalKvStore;
