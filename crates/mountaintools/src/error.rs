use cas::CasError;
use kvstore::KvError;
use mtconfig::ConfigError;
use thiserror::Error;

/// Errors surfaced by [`MountainClient`](crate::MountainClient) and
/// [`RemoteClient`](crate::RemoteClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Address or key absent locally and on every readable remote.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write attempted without valid credentials (or against a readonly remote).
    #[error("permission denied: {0}")]
    Permission(String),

    /// Remote unreachable during an operation that requires it.
    #[error("network error: {0}")]
    Network(String),

    /// Remote answered with an unexpected status.
    #[error("remote error {status}: {message}")]
    Remote { status: u16, message: String },

    /// Both local and remote writes are disabled.
    #[error("no write target: local and remote writes are both disabled")]
    NoWriteTarget,

    /// The policy asks for a remote but none is configured.
    #[error("no remote configured")]
    NoRemote,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("failed to (de)serialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound(_) => true,
            ClientError::Cas(e) => e.is_not_found(),
            _ => false,
        }
    }
}
