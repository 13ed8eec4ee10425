//! LocalKvStore: one JSON file per key, guarded by per-key file locks.
//!
//! Layout:
//! ```text
//! {root}/
//! └── 3f/
//!     └── a2/
//!         ├── 3fa2....json   # StoredEntry {key, record}
//!         └── 3fa2....lock   # flock target for writers of this key
//! ```
//!
//! Every write takes an exclusive lock on the key's lock file, reads the
//! current record, applies a [`KvOp`] and atomically replaces the entry
//! (temp file + rename). The lock is an OS-level flock, so it excludes
//! writers in other processes as well as other handles in this one.
//! Readers never lock: rename() guarantees they see a whole entry.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cas::Sha1Hash;
use fs4::FileExt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::KvError;
use crate::key::Key;
use crate::record::{KvOp, StoredEntry, ValueRecord};

/// Disk-backed key/value store.
#[derive(Debug, Clone)]
pub struct LocalKvStore {
    root: PathBuf,
    read_only: bool,
}

impl LocalKvStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KvError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(KvError::io("failed to create kv directory"))?;
        Ok(Self {
            root,
            read_only: false,
        })
    }

    /// Open without creating anything; all writes fail with `KvError::ReadOnly`.
    pub fn open_read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, hash: &Sha1Hash) -> PathBuf {
        let h = hash.as_str();
        self.root.join(&h[0..2]).join(&h[2..4])
    }

    fn entry_path(&self, hash: &Sha1Hash) -> PathBuf {
        self.shard_dir(hash).join(format!("{}.json", hash))
    }

    fn lock_path(&self, hash: &Sha1Hash) -> PathBuf {
        self.shard_dir(hash).join(format!("{}.lock", hash))
    }

    /// Read the raw record stored for a key hash.
    pub fn get_record_by_hash(&self, hash: &Sha1Hash) -> Result<Option<ValueRecord>, KvError> {
        let path = self.entry_path(hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KvError::Io {
                    context: format!("failed to read {}", path.display()),
                    source: e,
                })
            }
        };
        let entry: StoredEntry = serde_json::from_slice(&bytes)?;
        Ok(Some(entry.record))
    }

    /// Read the raw record stored for a key.
    pub fn get_record(&self, key: &Key) -> Result<Option<ValueRecord>, KvError> {
        self.get_record_by_hash(&key.hash())
    }

    /// Apply a write under the key's exclusive lock.
    ///
    /// Returns whether the operation took effect (always true for plain
    /// sets; false when a claim or compare-and-set lost).
    pub fn apply(&self, key: &Key, op: KvOp) -> Result<bool, KvError> {
        self.apply_by_hash(&key.hash(), key, op)
    }

    /// Like [`apply`](Self::apply) with a precomputed hash (used by share servers).
    pub fn apply_by_hash(&self, hash: &Sha1Hash, key: &Key, op: KvOp) -> Result<bool, KvError> {
        self.modify(hash, key, |current| op.apply(current))
    }

    /// Locked read-modify-write of one entry. The entry is rewritten only
    /// if the record changed.
    fn modify<F>(&self, hash: &Sha1Hash, key: &Key, f: F) -> Result<bool, KvError>
    where
        F: FnOnce(Option<ValueRecord>) -> (bool, Option<ValueRecord>),
    {
        if self.read_only {
            return Err(KvError::ReadOnly);
        }

        let _guard = self.lock(hash)?;
        let current = self.get_record_by_hash(hash)?;
        let unchanged = current.clone();
        let (applied, next) = f(current);

        if next != unchanged {
            match next {
                Some(record) => self.write_entry(
                    hash,
                    &StoredEntry {
                        key: key.clone(),
                        record,
                    },
                )?,
                None => self.remove_entry(hash)?,
            }
        }

        tracing::trace!(kv.hash = %hash, kv.applied = applied, "applied kv op");
        Ok(applied)
    }

    fn lock(&self, hash: &Sha1Hash) -> Result<File, KvError> {
        let path = self.lock_path(hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(KvError::io("failed to create kv shard directory"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| KvError::Lock {
                path: path.display().to_string(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| KvError::Lock {
            path: path.display().to_string(),
            source,
        })?;
        // Released when the handle is dropped.
        Ok(file)
    }

    fn write_entry(&self, hash: &Sha1Hash, entry: &StoredEntry) -> Result<(), KvError> {
        let path = self.entry_path(hash);
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec(entry)?;

        let mut file = File::create(&tmp).map_err(KvError::io("failed to create kv temp file"))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(KvError::io("failed to write kv entry"))?;
        fs::rename(&tmp, &path).map_err(KvError::io("failed to move kv entry into place"))?;
        Ok(())
    }

    fn remove_entry(&self, hash: &Sha1Hash) -> Result<(), KvError> {
        match fs::remove_file(self.entry_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KvError::Io {
                context: "failed to remove kv entry".to_string(),
                source: e,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Value-level conveniences
    // ------------------------------------------------------------------

    /// Get a value (or one subkey of it), decrypting with `password` if given.
    ///
    /// A wrong or missing password yields `Ok(None)`, never an error.
    pub fn get(
        &self,
        key: &Key,
        subkey: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<Value>, KvError> {
        let Some(record) = self.get_record(key)? else {
            return Ok(None);
        };
        Ok(match subkey {
            Some(s) => record.subkey(s).and_then(|r| r.open(password)),
            None => record.open(password),
        })
    }

    /// Set a value (or one subkey). `None` deletes; subkey `'-'` with `None`
    /// clears every subkey.
    pub fn set(
        &self,
        key: &Key,
        subkey: Option<&str>,
        value: Option<Value>,
        password: Option<&str>,
    ) -> Result<(), KvError> {
        let record = value.map(|v| ValueRecord::new(v, password)).transpose()?;
        let op = match subkey {
            Some(s) => KvOp::subkey(s, record)?,
            None => KvOp::Set { record },
        };
        self.apply(key, op)?;
        Ok(())
    }

    pub fn delete(&self, key: &Key) -> Result<(), KvError> {
        self.apply(key, KvOp::Set { record: None })?;
        Ok(())
    }

    /// Locked read-modify-write of a plain value.
    ///
    /// `f` sees the current value (`None` if absent or not a plain value)
    /// and returns the replacement; `None` deletes. Returns the new value.
    pub fn update<F>(&self, key: &Key, f: F) -> Result<Option<Value>, KvError>
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        let mut result = None;
        self.modify(&key.hash(), key, |current| {
            let value = match current {
                Some(ValueRecord::Value(v)) => Some(v),
                _ => None,
            };
            result = f(value);
            (true, result.clone().map(ValueRecord::Value))
        })?;
        Ok(result)
    }

    pub fn get_subkey(
        &self,
        key: &Key,
        subkey: &str,
        password: Option<&str>,
    ) -> Result<Option<Value>, KvError> {
        self.get(key, Some(subkey), password)
    }

    pub fn set_subkey(
        &self,
        key: &Key,
        subkey: &str,
        value: Option<Value>,
        password: Option<&str>,
    ) -> Result<(), KvError> {
        self.set(key, Some(subkey), value, password)
    }

    /// Remove every subkey under `key`.
    pub fn clear_subkeys(&self, key: &Key) -> Result<(), KvError> {
        self.apply(key, KvOp::ClearSubKeys)?;
        Ok(())
    }

    /// Claim primitive: store `value` only if nothing is stored.
    pub fn set_if_absent(&self, key: &Key, value: Value) -> Result<bool, KvError> {
        self.apply(
            key,
            KvOp::SetIfAbsent {
                record: ValueRecord::Value(value),
            },
        )
    }

    /// Replace the value only if it currently equals `expected` (`None` = absent).
    pub fn compare_and_set(
        &self,
        key: &Key,
        expected: Option<Value>,
        value: Option<Value>,
    ) -> Result<bool, KvError> {
        self.apply(
            key,
            KvOp::CompareAndSet {
                expected: expected.map(ValueRecord::Value),
                record: value.map(ValueRecord::Value),
            },
        )
    }

    /// Names of the subkeys stored under `key`.
    pub fn get_subkeys(&self, key: &Key) -> Result<BTreeSet<String>, KvError> {
        Ok(self
            .get_record(key)?
            .map(|r| r.subkey_names())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn store() -> (LocalKvStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalKvStore::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn test_set_get_delete() -> TestResult {
        let (kv, _dir) = store();
        let key = Key::from("hello");

        assert_eq!(kv.get(&key, None, None)?, None);
        kv.set(&key, None, Some(json!("world")), None)?;
        assert_eq!(kv.get(&key, None, None)?, Some(json!("world")));

        kv.set(&key, None, None, None)?;
        assert_eq!(kv.get(&key, None, None)?, None);
        Ok(())
    }

    #[test]
    fn test_structured_key_order_independent() -> TestResult {
        let (kv, _dir) = store();
        kv.set(&json!({"a": 1, "b": 2}).into(), None, Some(json!("v")), None)?;
        assert_eq!(
            kv.get(&json!({"b": 2, "a": 1}).into(), None, None)?,
            Some(json!("v"))
        );
        Ok(())
    }

    #[test]
    fn test_password_roundtrip_and_wrong_password() -> TestResult {
        let (kv, _dir) = store();
        let key = Key::from("secret");

        kv.set(&key, None, Some(json!({"v": 1})), Some("p"))?;
        assert_eq!(kv.get(&key, None, Some("p"))?, Some(json!({"v": 1})));
        assert_eq!(kv.get(&key, None, Some("wrong"))?, None);
        assert_eq!(kv.get(&key, None, None)?, None);
        Ok(())
    }

    #[test]
    fn test_subkeys_and_clear() -> TestResult {
        let (kv, _dir) = store();
        let parent = Key::from("parent");

        for (i, name) in ["k1", "k2", "k3"].iter().enumerate() {
            kv.set(&parent, Some(*name), Some(json!(i)), None)?;
        }
        let names: BTreeSet<String> = ["k1", "k2", "k3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(kv.get_subkeys(&parent)?, names);
        assert_eq!(kv.get(&parent, Some("k2"), None)?, Some(json!(1)));
        assert_eq!(kv.get(&parent, Some("missing"), None)?, None);

        kv.set(&parent, Some("-"), None, None)?;
        assert!(kv.get_subkeys(&parent)?.is_empty());
        assert_eq!(kv.get(&parent, Some("k1"), None)?, None);
        Ok(())
    }

    #[test]
    fn test_sealed_subkey() -> TestResult {
        let (kv, _dir) = store();
        let parent = Key::from("parent");

        kv.set(&parent, Some("s"), Some(json!("hidden")), Some("pw"))?;
        kv.set(&parent, Some("p"), Some(json!("open")), None)?;

        assert_eq!(kv.get(&parent, Some("s"), Some("pw"))?, Some(json!("hidden")));
        assert_eq!(kv.get(&parent, Some("s"), None)?, None);
        assert_eq!(kv.get(&parent, None, None)?, Some(json!({"p": "open"})));
        Ok(())
    }

    #[test]
    fn test_set_if_absent_and_compare_and_set() -> TestResult {
        let (kv, _dir) = store();
        let key = Key::from("claim");

        assert!(kv.set_if_absent(&key, json!("a"))?);
        assert!(!kv.set_if_absent(&key, json!("b"))?);
        assert_eq!(kv.get(&key, None, None)?, Some(json!("a")));

        assert!(!kv.compare_and_set(&key, Some(json!("x")), Some(json!("c")))?);
        assert!(kv.compare_and_set(&key, Some(json!("a")), Some(json!("c")))?);
        assert_eq!(kv.get(&key, None, None)?, Some(json!("c")));

        assert!(kv.compare_and_set(&key, Some(json!("c")), None)?);
        assert!(kv.compare_and_set(&key, None, Some(json!("d")))?);
        Ok(())
    }

    #[test]
    fn test_update_and_named_subkey_helpers() -> TestResult {
        let (kv, _dir) = store();
        let counter = Key::from("counter");

        let next = kv.update(&counter, |v| Some(json!(v.and_then(|v| v.as_u64()).unwrap_or(0) + 1)))?;
        assert_eq!(next, Some(json!(1)));
        kv.update(&counter, |v| Some(json!(v.and_then(|v| v.as_u64()).unwrap_or(0) + 1)))?;
        assert_eq!(kv.get(&counter, None, None)?, Some(json!(2)));
        kv.delete(&counter)?;
        assert_eq!(kv.get(&counter, None, None)?, None);

        let parent = Key::from("parts");
        kv.set_subkey(&parent, "a", Some(json!(1)), None)?;
        assert_eq!(kv.get_subkey(&parent, "a", None)?, Some(json!(1)));
        kv.clear_subkeys(&parent)?;
        assert!(kv.get_subkeys(&parent)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_read_only_rejects_writes() -> TestResult {
        let (kv, dir) = store();
        kv.set(&Key::from("k"), None, Some(json!(1)), None)?;

        let ro = LocalKvStore::open_read_only(dir.path());
        assert_eq!(ro.get(&Key::from("k"), None, None)?, Some(json!(1)));
        assert!(matches!(
            ro.set(&Key::from("k"), None, Some(json!(2)), None),
            Err(KvError::ReadOnly)
        ));
        Ok(())
    }

    #[test]
    fn test_entry_persists_key_for_inspection() -> TestResult {
        let (kv, _dir) = store();
        let key = Key::structured([("name", "x")]);
        kv.set(&key, None, Some(json!(1)), None)?;

        let bytes = fs::read(kv.entry_path(&key.hash()))?;
        let entry: StoredEntry = serde_json::from_slice(&bytes)?;
        assert_eq!(entry.key, key);
        Ok(())
    }
}
