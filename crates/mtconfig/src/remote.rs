//! Remote collection configuration.
//!
//! A remote is identified by (collection, share, credentials). Read and
//! write tokens are independent; a remote with no write token is readonly.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;

/// One remote collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL of the share server, e.g. `http://kv.example.org:8090`.
    pub url: String,

    /// Collection (namespace) on the server.
    pub collection: String,

    /// Optional share id, informational for `key://` addressing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_token: Option<String>,

    /// Per-request timeout in milliseconds.
    #[serde(default = "RemoteConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RemoteConfig {
    fn default_timeout_ms() -> u64 {
        30_000
    }

    /// Build a remote from `MOUNTAINTOOLS_URL` / `MOUNTAINTOOLS_COLLECTION`
    /// plus optional share and token variables.
    ///
    /// Missing URL or collection is an immediate error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// [`from_env`](Self::from_env) with variables read through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let require = |name: &str| match var(name) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(ConfigError::MissingEnv(name.to_string())),
        };
        let url = require("MOUNTAINTOOLS_URL")?;
        let collection = require("MOUNTAINTOOLS_COLLECTION")?;

        Ok(Self {
            url,
            collection,
            share: var("MOUNTAINTOOLS_SHARE"),
            read_token: var("MOUNTAINTOOLS_READ_TOKEN"),
            write_token: var("MOUNTAINTOOLS_WRITE_TOKEN"),
            timeout_ms: Self::default_timeout_ms(),
        })
    }

    /// A remote with no write credentials.
    pub fn readonly(mut self) -> Self {
        self.write_token = None;
        self
    }

    pub fn is_readonly(&self) -> bool {
        self.write_token.is_none()
    }
}

/// Named remotes plus the alias used when none is requested.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemotesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default)]
    pub aliases: BTreeMap<String, RemoteConfig>,
}

impl RemotesConfig {
    /// Resolve an alias (or the default alias).
    ///
    /// An explicitly named alias that does not exist is an error; a missing
    /// default simply means "no remote".
    pub fn resolve(&self, alias: Option<&str>) -> Result<Option<RemoteConfig>, ConfigError> {
        match alias.or(self.default.as_deref()) {
            Some(name) => self
                .aliases
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| ConfigError::UnknownRemote(name.to_string())),
            None => Ok(None),
        }
    }
}
