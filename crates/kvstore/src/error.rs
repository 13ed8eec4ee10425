use thiserror::Error;

/// Errors surfaced by the key/value store.
///
/// A failed write is always reported; reads that simply find nothing return
/// `Ok(None)` rather than an error.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error("failed to (de)serialize entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: String,
        source: std::io::Error,
    },

    #[error("encryption failed")]
    Crypto,

    #[error("key/value store is in read-only mode")]
    ReadOnly,

    #[error("subkey {0:?} is reserved")]
    ReservedSubKey(String),
}

impl KvError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| KvError::Io { context, source }
    }
}
