//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for the local cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    /// Root of the local cache. Blobs live in `{cache_dir}/sha1`,
    /// key/value entries in `{cache_dir}/kv`.
    /// Default: ~/.mountaintools
    #[serde(default = "PathsConfig::default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl PathsConfig {
    fn default_cache_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".mountaintools"))
            .unwrap_or_else(|| PathBuf::from(".mountaintools"))
    }

    /// Content store directory.
    pub fn cas_dir(&self) -> PathBuf {
        self.cache_dir.join("sha1")
    }

    /// Key/value store directory.
    pub fn kv_dir(&self) -> PathBuf {
        self.cache_dir.join("kv")
    }

    /// Scratch directory for realized files and job outputs.
    pub fn tmp_dir(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Share server settings (`mtserver`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    /// Default: 0.0.0.0
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,

    /// HTTP port.
    /// Default: 8090
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,

    /// Token required for reads. `None` means reads are public.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_token: Option<String>,

    /// Token required for writes. `None` disables writes entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_token: Option<String>,
}

impl ServerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8090
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            read_token: None,
            write_token: None,
        }
    }
}

/// All infrastructure configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_subdirs() {
        let paths = PathsConfig {
            cache_dir: PathBuf::from("/tmp/mt"),
        };
        assert_eq!(paths.cas_dir(), PathBuf::from("/tmp/mt/sha1"));
        assert_eq!(paths.kv_dir(), PathBuf::from("/tmp/mt/kv"));
        assert_eq!(paths.tmp_dir(), PathBuf::from("/tmp/mt/tmp"));
    }

    #[test]
    fn test_server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 8090);
        assert!(server.write_token.is_none());
    }
}
