//! MountainClient: one handle over the local cache and an optional remote.
//!
//! Every call consults the 4-bit [`Policy`]:
//! - reads try the local cache first, then the remote
//! - plain writes go to every enabled target
//! - claims (`set_if_absent`, `compare_and_set`) have a single authority:
//!   the remote when remote writes are on, otherwise the local store
//!
//! Values larger than [`MAX_INLINE_BYTES`] are moved into the content
//! store and the key holds `{"_content": "sha1://..."}` instead.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cas::{Address, BlobInfo, CasConfig, ContentStore, FileStore, Sha1Hash};
use kvstore::{canonical_json, Key, KvOp, LocalKvStore, ValueRecord};
use mtconfig::{MountainConfig, PolicyConfig as Policy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::remote::RemoteClient;

/// Serialized size above which values are stored by reference.
pub const MAX_INLINE_BYTES: usize = 16 * 1024;

/// Field holding the content address of an offloaded value.
pub const CONTENT_FIELD: &str = "_content";

/// Scheme for references resolved through a remote collection's keys.
pub const KEY_SCHEME: &str = "key://";

/// What a reference string points at.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference {
    Address(Address),
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct MountainClient {
    cas: FileStore,
    kv: LocalKvStore,
    remote: Option<RemoteClient>,
    policy: Policy,
    tmp_dir: PathBuf,
}

impl MountainClient {
    /// Local-only client rooted at `cache_dir`.
    pub fn open(cache_dir: impl AsRef<Path>) -> Result<Self, ClientError> {
        let dir = cache_dir.as_ref();
        Ok(Self {
            cas: FileStore::at_path(dir.join("sha1"))?,
            kv: LocalKvStore::open(dir.join("kv"))?,
            remote: None,
            policy: Policy::local_only(),
            tmp_dir: dir.join("tmp"),
        })
    }

    /// Build from configuration, picking the remote by alias (or the default).
    pub fn from_config(
        config: &MountainConfig,
        remote_alias: Option<&str>,
    ) -> Result<Self, ClientError> {
        let paths = &config.infra.paths;
        let policy = config.policy;

        let cas = FileStore::new(CasConfig::from_mountain_config(config))?;
        let kv = if policy.local_write {
            LocalKvStore::open(paths.kv_dir())?
        } else {
            LocalKvStore::open_read_only(paths.kv_dir())
        };
        let remote = config
            .remote(remote_alias)?
            .map(RemoteClient::new)
            .transpose()?;

        if policy.uses_remote() && remote.is_none() {
            return Err(ClientError::NoRemote);
        }

        Ok(Self {
            cas,
            kv,
            remote,
            policy,
            tmp_dir: paths.tmp_dir(),
        })
    }

    pub fn with_remote(mut self, remote: RemoteClient) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn remote(&self) -> Option<&RemoteClient> {
        self.remote.as_ref()
    }

    pub fn cas(&self) -> &FileStore {
        &self.cas
    }

    pub fn kv(&self) -> &LocalKvStore {
        &self.kv
    }

    /// Scratch directory for job outputs and uncached downloads.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Key under which `key://collection/name` references are looked up.
    ///
    /// The collection is part of the key so that the same name in two
    /// collections never shares a local entry.
    pub fn named_key(collection: &str, name: &str) -> Key {
        Key::structured([("collection", collection), ("name", name)])
    }

    fn writable_remote(&self) -> Result<&RemoteClient, ClientError> {
        let remote = self.remote.as_ref().ok_or(ClientError::NoRemote)?;
        if remote.is_readonly() {
            return Err(ClientError::Permission(format!(
                "remote collection '{}' is configured readonly",
                remote.collection()
            )));
        }
        Ok(remote)
    }

    /// Remote used for reads, if the policy allows one.
    fn readable_remote(&self) -> Result<Option<&RemoteClient>, ClientError> {
        if !self.policy.remote_read {
            return Ok(None);
        }
        self.remote.as_ref().map(Some).ok_or(ClientError::NoRemote)
    }

    // ------------------------------------------------------------------
    // Key/value
    // ------------------------------------------------------------------

    async fn read_record(
        &self,
        key: &Key,
        prefer_remote: bool,
    ) -> Result<Option<ValueRecord>, ClientError> {
        let remote = self.readable_remote()?;
        let key_hash = key.hash();

        if prefer_remote {
            if let Some(remote) = remote {
                // Authoritative read; a local copy could be stale.
                return Ok(remote.try_pull_record(&key_hash).await?);
            }
        }

        if self.policy.local_read {
            if let Some(record) = self.kv.get_record_by_hash(&key_hash)? {
                return Ok(Some(record));
            }
        }

        match remote {
            Some(remote) if self.policy.local_read => Ok(remote.pull_record(&key_hash).await),
            Some(remote) => Ok(remote.try_pull_record(&key_hash).await?),
            None => Ok(None),
        }
    }

    /// Apply a write to every enabled target.
    async fn write_op(&self, key: &Key, op: KvOp) -> Result<bool, ClientError> {
        if !self.policy.can_write() {
            return Err(ClientError::NoWriteTarget);
        }
        // Resolve the remote first so a readonly remote fails before any local write.
        let remote = if self.policy.remote_write {
            Some(self.writable_remote()?)
        } else {
            None
        };

        let mut applied = true;
        if self.policy.local_write {
            applied &= self.kv.apply(key, op.clone())?;
        }
        if let Some(remote) = remote {
            applied &= remote.push_op(key, op).await?;
        }
        Ok(applied)
    }

    /// Apply a conditional write against the single authoritative store.
    async fn claim_op(
        &self,
        key: &Key,
        op: KvOp,
        result: Option<ValueRecord>,
    ) -> Result<bool, ClientError> {
        if self.policy.remote_write {
            let applied = self.writable_remote()?.push_op(key, op).await?;
            if applied && self.policy.local_write {
                self.kv.apply(key, KvOp::Set { record: result })?;
            }
            return Ok(applied);
        }
        if self.policy.local_write {
            return Ok(self.kv.apply(key, op)?);
        }
        Err(ClientError::NoWriteTarget)
    }

    /// Read a value (or one subkey), local first.
    ///
    /// Sealed values need the matching password; a missing or wrong one
    /// reads as `None`, as does a plain value read with a password.
    pub async fn get_value(
        &self,
        key: &Key,
        subkey: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<Value>, ClientError> {
        let record = self.read_record(key, false).await?;
        self.open_record(record, subkey, password).await
    }

    /// Like [`get_value`](Self::get_value) but asks the remote first when
    /// one is readable. Used for keys other workers update.
    pub async fn get_latest_value(
        &self,
        key: &Key,
        subkey: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<Value>, ClientError> {
        let record = self.read_record(key, true).await?;
        self.open_record(record, subkey, password).await
    }

    async fn open_record(
        &self,
        record: Option<ValueRecord>,
        subkey: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<Value>, ClientError> {
        let Some(record) = record else {
            return Ok(None);
        };
        let opened = match subkey {
            Some(s) => record.subkey(s).and_then(|r| r.open(password)),
            None => record.open(password),
        };
        match opened {
            Some(value) => self.inflate(value).await,
            None => Ok(None),
        }
    }

    /// Replace a `{"_content": ...}` stand-in with the stored value.
    async fn inflate(&self, value: Value) -> Result<Option<Value>, ClientError> {
        let Some(address) = offloaded_address(&value) else {
            return Ok(Some(value));
        };
        match self.load_address(&address).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => {
                warn!(cas.address = %address, "offloaded value content is missing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Move large values into the content store. Sealed values stay inline.
    async fn deflate(&self, value: Value, password: Option<&str>) -> Result<Value, ClientError> {
        if password.is_some() {
            return Ok(value);
        }
        let serialized = canonical_json(&value);
        if serialized.len() <= MAX_INLINE_BYTES {
            return Ok(value);
        }
        let address = self.save_bytes(serialized.as_bytes(), None).await?;
        debug!(cas.address = %address, size = serialized.len(), "offloaded large value");
        Ok(json!({ CONTENT_FIELD: address.to_string() }))
    }

    /// Set a value (or one subkey) on every enabled target. `None` deletes;
    /// subkey `'-'` with `None` removes all subkeys.
    pub async fn set_value(
        &self,
        key: &Key,
        subkey: Option<&str>,
        value: Option<Value>,
        password: Option<&str>,
    ) -> Result<(), ClientError> {
        let value = match value {
            Some(v) => Some(self.deflate(v, password).await?),
            None => None,
        };
        let record = value.map(|v| ValueRecord::new(v, password)).transpose()?;
        let op = match subkey {
            Some(s) => KvOp::subkey(s, record)?,
            None => KvOp::Set { record },
        };
        self.write_op(key, op).await?;
        debug!(kv.key = %key, subkey = ?subkey, "set value");
        Ok(())
    }

    /// Claim primitive: store `value` only if the key is empty.
    pub async fn set_if_absent(&self, key: &Key, value: Value) -> Result<bool, ClientError> {
        let record = ValueRecord::Value(value);
        self.claim_op(
            key,
            KvOp::SetIfAbsent {
                record: record.clone(),
            },
            Some(record),
        )
        .await
    }

    /// Replace the value only if it currently equals `expected` (`None` = absent).
    pub async fn compare_and_set(
        &self,
        key: &Key,
        expected: Option<Value>,
        value: Option<Value>,
    ) -> Result<bool, ClientError> {
        let record = value.map(ValueRecord::Value);
        self.claim_op(
            key,
            KvOp::CompareAndSet {
                expected: expected.map(ValueRecord::Value),
                record: record.clone(),
            },
            record,
        )
        .await
    }

    pub async fn get_subkeys(&self, key: &Key) -> Result<BTreeSet<String>, ClientError> {
        Ok(self
            .read_record(key, false)
            .await?
            .map(|r| r.subkey_names())
            .unwrap_or_default())
    }

    /// Subkey names, asking the remote first when one is readable.
    pub async fn get_latest_subkeys(&self, key: &Key) -> Result<BTreeSet<String>, ClientError> {
        Ok(self
            .read_record(key, true)
            .await?
            .map(|r| r.subkey_names())
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Content
    // ------------------------------------------------------------------

    pub async fn save_bytes(
        &self,
        data: &[u8],
        basename: Option<&str>,
    ) -> Result<Address, ClientError> {
        if !self.policy.can_write() {
            return Err(ClientError::NoWriteTarget);
        }
        let remote = if self.policy.remote_write {
            Some(self.writable_remote()?)
        } else {
            None
        };

        let address = if self.policy.local_write {
            self.cas.save_bytes(data, basename)?
        } else {
            let address = Address::new(Sha1Hash::from_data(data));
            match basename {
                Some(b) => address.with_basename(b),
                None => address,
            }
        };
        if let Some(remote) = remote {
            remote.push_blob(&address.hash, data.to_vec()).await?;
        }
        Ok(address)
    }

    pub async fn save_text(
        &self,
        text: &str,
        basename: Option<&str>,
    ) -> Result<Address, ClientError> {
        self.save_bytes(text.as_bytes(), basename).await
    }

    /// Store a JSON-serializable object. Equal objects get equal addresses.
    pub async fn save_object<T: Serialize + ?Sized>(
        &self,
        object: &T,
        basename: Option<&str>,
    ) -> Result<Address, ClientError> {
        let value = serde_json::to_value(object)?;
        self.save_bytes(canonical_json(&value).as_bytes(), basename)
            .await
    }

    /// Store the content of a local file; `basename` defaults to its name.
    pub async fn save_file(
        &self,
        path: &Path,
        basename: Option<&str>,
    ) -> Result<Address, ClientError> {
        if !self.policy.can_write() {
            return Err(ClientError::NoWriteTarget);
        }
        if !self.policy.remote_write {
            return Ok(self.cas.save_file(path, basename)?);
        }

        let data = fs::read(path).map_err(|source| ClientError::Io {
            context: format!("failed to read {}", path.display()),
            source,
        })?;
        let default_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let basename = basename.map(str::to_string).or(default_name);
        self.save_bytes(&data, basename.as_deref()).await
    }

    /// Size and location of stored content, local or remote.
    pub async fn find(&self, address: &Address) -> Result<Option<BlobInfo>, ClientError> {
        if self.policy.local_read {
            if let Some(info) = self.cas.find(&address.hash)? {
                return Ok(Some(info));
            }
        }
        let Some(remote) = self.readable_remote()? else {
            return Ok(None);
        };
        Ok(remote
            .find_blob(&address.hash)
            .await
            .map(|size| BlobInfo::new(address.hash.clone(), size)))
    }

    async fn load_address(&self, address: &Address) -> Result<Vec<u8>, ClientError> {
        if self.policy.local_read {
            match self.cas.load(address) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        match self.fetch_remote(&address.hash).await? {
            Some(bytes) => Ok(bytes),
            None => Err(ClientError::NotFound(address.to_string())),
        }
    }

    /// Download from the remote, caching locally when allowed.
    async fn fetch_remote(&self, hash: &Sha1Hash) -> Result<Option<Vec<u8>>, ClientError> {
        let Some(remote) = self.readable_remote()? else {
            return Ok(None);
        };
        let Some(bytes) = remote.pull_blob(hash).await else {
            return Ok(None);
        };
        if self.policy.local_write {
            if let Err(e) = self.cas.save_verified(&bytes, hash) {
                warn!(cas.hash = %hash, error = %e, "failed to cache remote blob");
            }
        }
        Ok(Some(bytes))
    }

    /// Turn a reference (address, `key://` reference or local path) into
    /// something loadable.
    async fn resolve(&self, reference: &str) -> Result<Reference, ClientError> {
        if let Some(rest) = reference.strip_prefix(KEY_SCHEME) {
            let address = self.resolve_key_reference(reference, rest).await?;
            return Ok(Reference::Address(address));
        }
        if Address::is_address(reference) {
            return Ok(Reference::Address(
                Address::parse(reference).map_err(cas::CasError::from)?,
            ));
        }
        Ok(Reference::Path(PathBuf::from(reference)))
    }

    async fn resolve_key_reference(
        &self,
        reference: &str,
        rest: &str,
    ) -> Result<Address, ClientError> {
        let (collection, name) = rest
            .split_once('/')
            .filter(|(c, n)| !c.is_empty() && !n.is_empty())
            .ok_or_else(|| ClientError::NotFound(reference.to_string()))?;
        let key = Self::named_key(collection, name);

        let mut value = None;
        if self.policy.local_read {
            value = self.kv.get(&key, None, None)?;
        }
        if value.is_none() {
            if let Some(remote) = self.readable_remote()? {
                let remote = remote.for_collection(collection);
                value = remote
                    .pull_record(&key.hash())
                    .await
                    .and_then(|r| r.open(None));
            }
        }

        let target = value
            .as_ref()
            .and_then(Value::as_str)
            .filter(|s| Address::is_address(s))
            .ok_or_else(|| ClientError::NotFound(reference.to_string()))?;
        debug!(reference, target, "resolved key reference");
        Ok(Address::parse(target).map_err(cas::CasError::from)?)
    }

    /// Content address behind a reference; `None` for local paths.
    pub async fn resolve_address(&self, reference: &str) -> Result<Option<Address>, ClientError> {
        Ok(match self.resolve(reference).await? {
            Reference::Address(address) => Some(address),
            Reference::Path(_) => None,
        })
    }

    pub async fn load_bytes(&self, reference: &str) -> Result<Vec<u8>, ClientError> {
        match self.resolve(reference).await? {
            Reference::Address(address) => self.load_address(&address).await,
            Reference::Path(path) => fs::read(&path).map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => ClientError::NotFound(reference.to_string()),
                _ => ClientError::Io {
                    context: format!("failed to read {}", path.display()),
                    source,
                },
            }),
        }
    }

    pub async fn load_text(&self, reference: &str) -> Result<String, ClientError> {
        let bytes = self.load_bytes(reference).await?;
        String::from_utf8(bytes).map_err(|e| ClientError::Io {
            context: format!("{} is not utf-8 text", reference),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }

    pub async fn load_object<T: DeserializeOwned>(&self, reference: &str) -> Result<T, ClientError> {
        let bytes = self.load_bytes(reference).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Local filesystem path holding the referenced content, downloading
    /// it first if needed. Addresses with a basename realize to a file of
    /// that name.
    pub async fn realize_file(&self, reference: &str) -> Result<PathBuf, ClientError> {
        let address = match self.resolve(reference).await? {
            Reference::Path(path) => {
                return if path.exists() {
                    Ok(path)
                } else {
                    Err(ClientError::NotFound(reference.to_string()))
                };
            }
            Reference::Address(address) => address,
        };

        let have_local = self.policy.local_read && self.cas.exists(&address.hash);
        if !have_local {
            let Some(bytes) = self.fetch_remote(&address.hash).await? else {
                return Err(ClientError::NotFound(reference.to_string()));
            };
            if !self.policy.local_write {
                return self.write_scratch(&address, &bytes);
            }
        }

        if self.policy.local_write {
            Ok(self.cas.realize_with_basename(&address)?)
        } else {
            Ok(self.cas.realize(&address)?)
        }
    }

    /// Place downloaded content in the scratch directory without touching the cache.
    fn write_scratch(&self, address: &Address, bytes: &[u8]) -> Result<PathBuf, ClientError> {
        let name = address
            .basename
            .clone()
            .unwrap_or_else(|| address.hash.to_string());
        let target = self.tmp_dir.join(address.hash.as_str()).join(name);
        if target.exists() {
            return Ok(target);
        }
        let io_err = |context: &str| {
            let context = context.to_string();
            move |source| ClientError::Io { context, source }
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err("failed to create scratch directory"))?;
        }
        let partial = target.with_extension("partial");
        fs::write(&partial, bytes).map_err(io_err("failed to write scratch file"))?;
        fs::rename(&partial, &target).map_err(io_err("failed to move scratch file"))?;
        Ok(target)
    }
}

/// The address in a `{"_content": "sha1://..."}` stand-in, if `value` is one.
fn offloaded_address(value: &Value) -> Option<Address> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let target = map.get(CONTENT_FIELD)?.as_str()?;
    Address::parse(target).ok()
}
