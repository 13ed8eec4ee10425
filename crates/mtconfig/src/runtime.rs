//! Runtime behavior: store policy, batch timing, batch commands.

use serde::{Deserialize, Serialize};

/// The 4-bit read/write policy governing every store and load call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub local_read: bool,
    #[serde(default = "default_true")]
    pub local_write: bool,
    #[serde(default)]
    pub remote_read: bool,
    #[serde(default)]
    pub remote_write: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            local_read: true,
            local_write: true,
            remote_read: false,
            remote_write: false,
        }
    }
}

impl PolicyConfig {
    /// Read and write the local cache only.
    pub fn local_only() -> Self {
        Self::default()
    }

    /// Talk to the remote only; nothing touches the local cache.
    pub fn remote_only() -> Self {
        Self {
            local_read: false,
            local_write: false,
            remote_read: true,
            remote_write: true,
        }
    }

    /// Everything on: local first, remote as fallback and mirror.
    pub fn local_and_remote() -> Self {
        Self {
            local_read: true,
            local_write: true,
            remote_read: true,
            remote_write: true,
        }
    }

    pub fn uses_remote(&self) -> bool {
        self.remote_read || self.remote_write
    }

    pub fn can_write(&self) -> bool {
        self.local_write || self.remote_write
    }
}

/// Batch coordinator timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchConfig {
    /// Age after which an in-process claim may be reclaimed by another worker.
    /// Default: 3600
    #[serde(default = "BatchConfig::default_claim_stale_secs")]
    pub claim_stale_secs: u64,

    /// How long an idle worker sleeps between scans.
    /// Default: 2000
    #[serde(default = "BatchConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl BatchConfig {
    fn default_claim_stale_secs() -> u64 {
        3600
    }

    fn default_poll_interval_ms() -> u64 {
        2000
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            claim_stale_secs: Self::default_claim_stale_secs(),
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

/// A batch command implemented by an external program.
///
/// `command` is split on whitespace; `{name}` placeholders are replaced by
/// the input path, output path or parameter of the same name. Placeholders
/// not listed as inputs or outputs are parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandConfig {
    pub command: String,

    #[serde(default = "CommandConfig::default_version")]
    pub version: String,

    /// Placeholders that name input files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,

    /// Placeholders that name output files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

impl CommandConfig {
    fn default_version() -> String {
        "0.0.0".to_string()
    }
}
