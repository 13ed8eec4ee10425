//! Content store configuration.
//!
//! Default path: `~/.mountaintools/sha1`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasConfig {
    /// Base path for blob storage.
    /// Objects are sharded as `{base_path}/{h[0]}/{h[1..3]}/{h}`; in-flight
    /// writes and realized copies live under `{base_path}/tmp/`.
    pub base_path: PathBuf,

    /// Reject saves; set when the client policy disables local writes.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self::with_base_path(mtconfig::PathsConfig::default().cas_dir())
    }
}

impl CasConfig {
    /// Writable store rooted at `path`.
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            read_only: false,
        }
    }

    /// Store rooted at `path` that only serves existing content.
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            read_only: true,
        }
    }

    /// Derive from the shared mountaintools configuration.
    pub fn from_mountain_config(config: &mtconfig::MountainConfig) -> Self {
        Self {
            base_path: config.infra.paths.cas_dir(),
            read_only: !config.policy.local_write,
        }
    }

    /// Scratch directory for temp files and realized copies.
    pub fn tmp_dir(&self) -> PathBuf {
        self.base_path.join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_under_cache_dir() {
        let config = CasConfig::default();
        assert!(config.base_path.ends_with("sha1"));
        assert!(config.base_path.to_string_lossy().contains(".mountaintools"));
        assert!(!config.read_only);
        assert!(CasConfig::read_only("/srv/share/sha1").read_only);
    }

    #[test]
    fn test_from_mountain_config_follows_policy() {
        let mut mt = mtconfig::MountainConfig::default();
        mt.infra.paths.cache_dir = PathBuf::from("/data/mt");
        mt.policy.local_write = false;

        let config = CasConfig::from_mountain_config(&mt);
        assert_eq!(config.base_path, PathBuf::from("/data/mt/sha1"));
        assert!(config.read_only);
        assert_eq!(config.tmp_dir(), PathBuf::from("/data/mt/sha1/tmp"));
    }
}
