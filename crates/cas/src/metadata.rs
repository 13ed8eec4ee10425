//! Information about stored blobs.

use crate::hash::{Address, Sha1Hash};
use serde::{Deserialize, Serialize};

/// What `find()` reports about a blob without reading its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobInfo {
    pub hash: Sha1Hash,

    /// Size in bytes.
    pub size: u64,

    /// Local filesystem path to the content (if available).
    /// `None` for blobs that only exist on a remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl BlobInfo {
    pub fn new(hash: Sha1Hash, size: u64) -> Self {
        Self {
            hash,
            size,
            local_path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn address(&self) -> Address {
        Address::new(self.hash.clone())
    }
}
