//! Per-collection storage behind the share server.
//!
//! ```text
//! {root}/
//! └── {collection}/
//!     ├── kv/      # LocalKvStore
//!     └── sha1/    # FileStore
//! ```

use std::path::{Path, PathBuf};

use cas::FileStore;
use kvstore::LocalKvStore;

use crate::error::ApiError;

/// Shared state for the HTTP handlers.
#[derive(Debug, Clone)]
pub struct ServerState {
    root: PathBuf,
    read_token: Option<String>,
    write_token: Option<String>,
}

impl ServerState {
    /// Public reads, no writes until a write token is set.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_token: None,
            write_token: None,
        }
    }

    pub fn with_tokens(mut self, read_token: Option<String>, write_token: Option<String>) -> Self {
        self.read_token = read_token;
        self.write_token = write_token;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads pass with the read token, the write token, or when no read
    /// token is configured.
    pub fn check_read(&self, bearer: Option<&str>) -> Result<(), ApiError> {
        let Some(expected) = self.read_token.as_deref() else {
            return Ok(());
        };
        match bearer {
            Some(t) if t == expected || Some(t) == self.write_token.as_deref() => Ok(()),
            Some(_) => Err(ApiError::forbidden("invalid read token")),
            None => Err(ApiError::unauthorized("read token required")),
        }
    }

    /// Writes need the write token; without one configured the server is readonly.
    pub fn check_write(&self, bearer: Option<&str>) -> Result<(), ApiError> {
        let Some(expected) = self.write_token.as_deref() else {
            return Err(ApiError::forbidden("server is readonly"));
        };
        match bearer {
            Some(t) if t == expected => Ok(()),
            Some(_) => Err(ApiError::forbidden("invalid write token")),
            None => Err(ApiError::unauthorized("write token required")),
        }
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, ApiError> {
        let valid = !collection.is_empty()
            && !collection.starts_with('.')
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(ApiError::bad_request(format!(
                "invalid collection name: {}",
                collection
            )));
        }
        Ok(self.root.join(collection))
    }

    pub fn kv(&self, collection: &str) -> Result<LocalKvStore, ApiError> {
        let dir = self.collection_dir(collection)?;
        Ok(LocalKvStore::open(dir.join("kv"))?)
    }

    pub fn cas(&self, collection: &str) -> Result<FileStore, ApiError> {
        let dir = self.collection_dir(collection)?;
        Ok(FileStore::at_path(dir.join("sha1"))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_collection_names() {
        let state = ServerState::new("/tmp/share");
        assert!(state.collection_dir("lab-1_a.b").is_ok());
        assert!(state.collection_dir("").is_err());
        assert!(state.collection_dir("..").is_err());
        assert!(state.collection_dir("a/b").is_err());
    }

    #[test]
    fn test_token_checks() {
        let state = ServerState::new("/tmp/share")
            .with_tokens(Some("r".to_string()), Some("w".to_string()));

        assert!(state.check_read(Some("r")).is_ok());
        assert!(state.check_read(Some("w")).is_ok());
        assert_eq!(state.check_read(None).unwrap_err().status, StatusCode::UNAUTHORIZED);
        assert_eq!(state.check_write(Some("r")).unwrap_err().status, StatusCode::FORBIDDEN);
        assert!(state.check_write(Some("w")).is_ok());

        let public = ServerState::new("/tmp/share");
        assert!(public.check_read(None).is_ok());
        assert_eq!(public.check_write(Some("w")).unwrap_err().status, StatusCode::FORBIDDEN);
    }
}
