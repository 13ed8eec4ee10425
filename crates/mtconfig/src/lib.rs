//! Configuration loading for mountaintools.
//!
//! Every client, worker and server in the workspace is constructed from an
//! explicit [`MountainConfig`] value. Nothing here is process-global: load a
//! config, hand it to the client you build, and tests can run as many
//! isolated clients side by side as they like.
//!
//! # Sections
//!
//! - **Infrastructure** (`InfraConfig`): cache paths, log level, share
//!   server settings.
//! - **Remotes** (`RemotesConfig`): named remote collections with their URL
//!   and read/write credentials.
//! - **Runtime** (`PolicyConfig`, `BatchConfig`, `CommandConfig`): the
//!   4-bit read/write policy, batch claim timing, and batch commands.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/mountaintools/config.toml` (system)
//! 2. `~/.config/mountaintools/config.toml` (user)
//! 3. `./mountaintools.toml` (local override, or a path given on the CLI)
//! 4. Environment variables (`MOUNTAINTOOLS_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! cache_dir = "~/.mountaintools"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [remotes]
//! default = "lab"
//!
//! [remotes.aliases.lab]
//! url = "http://kv.example.org:8090"
//! collection = "spikeforest"
//! read_token = "r3ad"
//! write_token = "wr1te"
//!
//! [policy]
//! local_read = true
//! local_write = true
//! remote_read = true
//! remote_write = false
//!
//! [batch]
//! claim_stale_secs = 3600
//!
//! [commands.sort]
//! command = "run_sorter --input {recording} --threshold {threshold}"
//! version = "0.2.0"
//! ```

pub mod infra;
pub mod loader;
pub mod remote;
pub mod runtime;

pub use infra::{InfraConfig, PathsConfig, ServerConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};
pub use remote::{RemoteConfig, RemotesConfig};
pub use runtime::{BatchConfig, CommandConfig, PolicyConfig};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Required environment variable {0} is not set")]
    MissingEnv(String),

    #[error("Unknown remote alias: {0}")]
    UnknownRemote(String),

    #[error("No remote configured")]
    NoRemote,
}

/// Complete mountaintools configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountainConfig {
    /// Infrastructure - paths, logging, server bind settings.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Remote collections keyed by alias.
    #[serde(default)]
    pub remotes: RemotesConfig,

    /// Read/write policy applied by every store call.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Batch coordinator timing.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Batch commands backed by external programs.
    #[serde(default)]
    pub commands: BTreeMap<String, CommandConfig>,
}

impl MountainConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/mountaintools/config.toml`
    /// 3. `~/.config/mountaintools/config.toml`
    /// 4. `./mountaintools.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./mountaintools.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, &PathBuf::from("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources)?;

        Ok((config, sources))
    }

    /// Parse a single TOML document without consulting the filesystem or env.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let path = PathBuf::from("<inline>");
        let table = loader::parse_table(contents, &path)?;
        loader::from_table(table, &path)
    }

    /// Resolve the remote to use: the named alias, or the configured default.
    ///
    /// Returns `Ok(None)` when no remote is configured at all.
    pub fn remote(&self, alias: Option<&str>) -> Result<Option<RemoteConfig>, ConfigError> {
        self.remotes.resolve(alias)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# mountaintools configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to serialize: {}\n", e)),
        }
        output
    }
}
