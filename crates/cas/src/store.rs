//! FileStore: Filesystem-based content store.
//!
//! Implements the ContentStore trait using a local filesystem with two-level
//! directory sharding.
//!
//! Layout:
//! ```text
//! {base_path}/
//! ├── a/
//! │   └── 99/
//! │       └── a9993e364706816aba3e25717850c26c9cd0d89d
//! ├── 2/
//! │   └── aa/
//! │       └── 2aae6c35c94fcfb415dbe95f408b9ce91ee846ed
//! └── tmp/
//!     ├── 6f1c....partial          # in-flight write, renamed into place
//!     └── a9993e.../firings.mda    # realized copy with its basename
//! ```

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::CasConfig;
use crate::error::CasError;
use crate::hash::{Address, Sha1Hash};
use crate::metadata::BlobInfo;

/// Trait for content storage backends.
pub trait ContentStore: Send + Sync {
    /// Store bytes, returning their address.
    ///
    /// If the content already exists, nothing is written.
    fn save_bytes(&self, data: &[u8], basename: Option<&str>) -> Result<Address, CasError>;

    /// Store the content of a local file.
    ///
    /// `basename` defaults to the file's own name.
    fn save_file(&self, path: &Path, basename: Option<&str>) -> Result<Address, CasError>;

    /// Load the bytes behind an address. Absent content is `CasError::NotFound`.
    fn load(&self, address: &Address) -> Result<Vec<u8>, CasError>;

    /// Path to a local file holding the content. Absent content is `CasError::NotFound`.
    fn realize(&self, address: &Address) -> Result<PathBuf, CasError>;

    /// Check if content exists without reading it.
    fn exists(&self, hash: &Sha1Hash) -> bool;

    /// Size and location of stored content, `Ok(None)` if absent.
    fn find(&self, hash: &Sha1Hash) -> Result<Option<BlobInfo>, CasError>;
}

/// Filesystem-based content store.
#[derive(Debug, Clone)]
pub struct FileStore {
    config: CasConfig,
}

impl FileStore {
    /// Create a new FileStore with the given configuration.
    ///
    /// Creates the base and tmp directories if they don't exist
    /// (unless in read-only mode).
    pub fn new(config: CasConfig) -> Result<Self, CasError> {
        if !config.read_only {
            fs::create_dir_all(config.tmp_dir())
                .map_err(CasError::io("failed to create content store directory"))?;
        }

        Ok(Self { config })
    }

    /// Create a FileStore at a specific path.
    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self, CasError> {
        Self::new(CasConfig::with_base_path(path))
    }

    /// Create a read-only FileStore at a specific path.
    pub fn read_only_at(path: impl Into<PathBuf>) -> Result<Self, CasError> {
        Self::new(CasConfig::read_only(path))
    }

    pub fn config(&self) -> &CasConfig {
        &self.config
    }

    /// Get the path where an object would be stored.
    pub fn object_path(&self, hash: &Sha1Hash) -> PathBuf {
        self.config
            .base_path
            .join(hash.shard_outer())
            .join(hash.shard_inner())
            .join(hash.as_str())
    }

    /// Path to an existing object, if present.
    pub fn path(&self, hash: &Sha1Hash) -> Option<PathBuf> {
        let path = self.object_path(hash);
        path.exists().then_some(path)
    }

    fn ensure_writable(&self) -> Result<(), CasError> {
        if self.config.read_only {
            return Err(CasError::ReadOnly);
        }
        Ok(())
    }

    fn partial_path(&self) -> PathBuf {
        self.config
            .tmp_dir()
            .join(format!("{}.partial", Uuid::new_v4().simple()))
    }

    /// Move a fully written temp file into its sharded location.
    ///
    /// rename() is atomic, so concurrent writers of identical content race
    /// harmlessly: whichever lands last replaces an identical file.
    fn commit(&self, partial: &Path, hash: &Sha1Hash) -> Result<PathBuf, CasError> {
        let obj_path = self.object_path(hash);

        if obj_path.exists() {
            let _ = fs::remove_file(partial);
            return Ok(obj_path);
        }

        if let Some(parent) = obj_path.parent() {
            fs::create_dir_all(parent)
                .map_err(CasError::io("failed to create object shard directory"))?;
        }

        fs::rename(partial, &obj_path).map_err(CasError::io("failed to move object into place"))?;
        tracing::debug!(cas.hash = %hash, "stored object");
        Ok(obj_path)
    }

    /// Store bytes that must hash to `expected`; used when caching remote downloads.
    pub fn save_verified(&self, data: &[u8], expected: &Sha1Hash) -> Result<Address, CasError> {
        let actual = Sha1Hash::from_data(data);
        if &actual != expected {
            return Err(CasError::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        self.save_bytes(data, None)
    }

    /// Materialize the content as a file named by the address basename.
    ///
    /// The copy lives in `{base}/tmp/{hash}/{basename}` and is reused once
    /// present. Without a basename this is the same as `realize`.
    pub fn realize_with_basename(&self, address: &Address) -> Result<PathBuf, CasError> {
        let object = self.realize(address)?;
        let Some(basename) = address.basename.as_deref() else {
            return Ok(object);
        };
        self.ensure_writable()?;

        let target = self.config.tmp_dir().join(address.hash.as_str()).join(basename);
        if target.exists() {
            return Ok(target);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(CasError::io("failed to create realize directory"))?;
        }

        let partial = self.partial_path();
        fs::copy(&object, &partial).map_err(CasError::io("failed to copy object"))?;
        fs::rename(&partial, &target).map_err(CasError::io("failed to move realized file"))?;
        Ok(target)
    }
}

impl ContentStore for FileStore {
    fn save_bytes(&self, data: &[u8], basename: Option<&str>) -> Result<Address, CasError> {
        self.ensure_writable()?;

        let hash = Sha1Hash::from_data(data);

        // Skip if exists - content-addressed = idempotent
        if !self.object_path(&hash).exists() {
            let partial = self.partial_path();
            let mut file =
                File::create(&partial).map_err(CasError::io("failed to create temp file"))?;
            file.write_all(data)
                .and_then(|_| file.sync_all())
                .map_err(CasError::io("failed to write object file"))?;
            self.commit(&partial, &hash)?;
        }

        let address = Address::new(hash);
        Ok(match basename {
            Some(b) => address.with_basename(b),
            None => address,
        })
    }

    fn save_file(&self, path: &Path, basename: Option<&str>) -> Result<Address, CasError> {
        self.ensure_writable()?;

        let source = File::open(path)
            .map_err(CasError::io(format!("failed to open {}", path.display())))?;
        let hash = Sha1Hash::from_reader(io::BufReader::new(source))
            .map_err(CasError::io(format!("failed to hash {}", path.display())))?;

        if !self.object_path(&hash).exists() {
            let partial = self.partial_path();
            fs::copy(path, &partial)
                .map_err(CasError::io(format!("failed to copy {}", path.display())))?;

            // The source may have changed between hashing and copying.
            let copied = File::open(&partial)
                .and_then(|f| Sha1Hash::from_reader(io::BufReader::new(f)))
                .map_err(CasError::io("failed to re-hash copied file"))?;
            if copied != hash {
                let _ = fs::remove_file(&partial);
                return Err(CasError::HashMismatch {
                    expected: hash,
                    actual: copied,
                });
            }
            self.commit(&partial, &hash)?;
        }

        let default_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let address = Address::new(hash);
        Ok(match basename.map(str::to_string).or(default_name) {
            Some(b) => address.with_basename(b),
            None => address,
        })
    }

    fn load(&self, address: &Address) -> Result<Vec<u8>, CasError> {
        let path = self.object_path(&address.hash);
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CasError::NotFound(address.to_string()))
            }
            Err(e) => Err(CasError::Io {
                context: "failed to read object file".to_string(),
                source: e,
            }),
        }
    }

    fn realize(&self, address: &Address) -> Result<PathBuf, CasError> {
        self.path(&address.hash)
            .ok_or_else(|| CasError::NotFound(address.to_string()))
    }

    fn exists(&self, hash: &Sha1Hash) -> bool {
        self.object_path(hash).exists()
    }

    fn find(&self, hash: &Sha1Hash) -> Result<Option<BlobInfo>, CasError> {
        let path = self.object_path(hash);
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(
                BlobInfo::new(hash.clone(), meta.len()).with_path(path.to_string_lossy()),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CasError::Io {
                context: "failed to stat object file".to_string(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_save_and_load() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let address = store.save_bytes(b"Hello, World!", None)?;
        assert_eq!(address.hash.as_str().len(), 40);
        assert_eq!(store.load(&address)?, b"Hello, World!");

        Ok(())
    }

    #[test]
    fn test_empty_content_roundtrip() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let address = store.save_bytes(b"", None)?;
        assert_eq!(
            address.hash.as_str(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert!(store.load(&address)?.is_empty());

        Ok(())
    }

    #[test]
    fn test_sharded_layout() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let address = store.save_bytes(b"abc", None)?;
        let expected = temp_dir
            .path()
            .join("a")
            .join("99")
            .join("a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(store.realize(&address)?, expected);

        Ok(())
    }

    #[test]
    fn test_idempotent_save() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let first = store.save_bytes(b"Duplicate Me", None)?;
        let path = store.realize(&first)?;
        let modified = fs::metadata(&path)?.modified()?;

        let second = store.save_bytes(b"Duplicate Me", None)?;
        assert_eq!(first, second);
        assert_eq!(fs::metadata(&path)?.modified()?, modified);

        // No stray temp files left behind
        assert_eq!(fs::read_dir(store.config().tmp_dir())?.count(), 0);

        Ok(())
    }

    #[test]
    fn test_basename_carried_in_address() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let address = store.save_bytes(b"firings", Some("firings.mda"))?;
        assert!(address.to_string().ends_with("/firings.mda"));

        let copy = store.realize_with_basename(&address)?;
        assert_eq!(copy.file_name().unwrap(), "firings.mda");
        assert_eq!(fs::read(&copy)?, b"firings");

        // Reused on the second call
        assert_eq!(store.realize_with_basename(&address)?, copy);

        Ok(())
    }

    #[test]
    fn test_save_file_uses_file_name() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path().join("cas"))?;

        let source = temp_dir.path().join("raw.dat");
        fs::write(&source, vec![3u8; 100_000])?;

        let address = store.save_file(&source, None)?;
        assert_eq!(address.basename.as_deref(), Some("raw.dat"));
        assert_eq!(address.hash, Sha1Hash::from_data(&vec![3u8; 100_000]));
        assert_eq!(store.load(&address)?.len(), 100_000);

        Ok(())
    }

    #[test]
    fn test_missing_is_not_found() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let missing = Address::new(Sha1Hash::from_data(b"never stored"));
        assert!(store.load(&missing).unwrap_err().is_not_found());
        assert!(store.realize(&missing).unwrap_err().is_not_found());
        assert!(store.find(&missing.hash)?.is_none());
        assert!(!store.exists(&missing.hash));

        Ok(())
    }

    #[test]
    fn test_find_reports_size() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let address = store.save_bytes(b"twelve bytes", None)?;
        let info = store.find(&address.hash)?.expect("should exist");
        assert_eq!(info.size, 12);
        assert!(info.local_path.is_some());

        Ok(())
    }

    #[test]
    fn test_save_verified_rejects_mismatch() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let wrong = Sha1Hash::from_data(b"something else");
        let err = store.save_verified(b"payload", &wrong).unwrap_err();
        assert!(matches!(err, CasError::HashMismatch { .. }));
        assert!(!store.exists(&Sha1Hash::from_data(b"payload")));

        Ok(())
    }

    #[test]
    fn test_read_only_prevents_writes() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = FileStore::read_only_at(temp_dir.path())?;

        let result = store.save_bytes(b"should fail", None);
        assert!(matches!(result, Err(CasError::ReadOnly)));

        Ok(())
    }

    #[test]
    fn test_read_only_allows_reads() -> TestResult {
        let temp_dir = TempDir::new()?;

        let writable = FileStore::at_path(temp_dir.path())?;
        let address = writable.save_bytes(b"readable content", None)?;

        let readonly = FileStore::read_only_at(temp_dir.path())?;
        assert_eq!(readonly.load(&address)?, b"readable content");

        Ok(())
    }

    #[test]
    fn test_concurrent_writes() -> TestResult {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(FileStore::at_path(temp_dir.path())?);

        let data = b"Concurrent Data";
        let expected = Sha1Hash::from_data(data);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.save_bytes(data, None).expect("write failed"))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().hash, expected);
        }

        assert_eq!(store.load(&Address::new(expected))?, data);
        Ok(())
    }
}
