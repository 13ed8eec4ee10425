use crate::hash::{HashError, Sha1Hash};
use thiserror::Error;

/// Errors surfaced by the content store.
///
/// Storage errors are never swallowed: a failed write is reported to the caller.
#[derive(Debug, Error)]
pub enum CasError {
    #[error("content not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidAddress(#[from] HashError),

    #[error("content store is in read-only mode")]
    ReadOnly,

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Sha1Hash, actual: Sha1Hash },

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl CasError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| CasError::Io { context, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CasError::NotFound(_))
    }
}
