//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, MountainConfig, RemoteConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Which files and variables a loaded config came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Files merged, lowest precedence first.
    pub files: Vec<PathBuf>,
    /// Variables that replaced file values.
    pub env_overrides: Vec<String>,
}

/// Existing config files in merge order: system, user, then either the
/// path given on the command line or `./mountaintools.toml`.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/mountaintools/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(dirs) = directories::BaseDirs::new() {
        let user = dirs.config_dir().join("mountaintools").join("config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    let last = match cli_path {
        Some(path) if path.exists() => path.to_path_buf(),
        _ => PathBuf::from("mountaintools.toml"),
    };
    if last.exists() {
        files.push(last);
    }
    files
}

/// Read a config file as a raw TOML table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deserialize a merged table into a config, filling in defaults.
pub(crate) fn from_table(table: toml::Table, path: &Path) -> Result<MountainConfig, ConfigError> {
    let mut config: MountainConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

    config.infra.paths.cache_dir = expand_path(&config.infra.paths.cache_dir.to_string_lossy());
    Ok(config)
}

/// Merge `overlay` into `base`. Nested tables merge key by key; any other
/// value in the overlay replaces the base value.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
///
/// A remote half-described by the environment (URL without collection or
/// the other way round) is an error, not a silent fallback to local.
pub fn apply_env_overrides(
    config: &mut MountainConfig,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    apply_overrides(config, sources, |name| env::var(name).ok())
}

/// [`apply_env_overrides`] with variables read through `var`.
pub fn apply_overrides(
    config: &mut MountainConfig,
    sources: &mut ConfigSources,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(v) = var("MOUNTAINTOOLS_CACHE_DIR") {
        config.infra.paths.cache_dir = expand_path(&v);
        sources.env_overrides.push("MOUNTAINTOOLS_CACHE_DIR".to_string());
    }

    // RUST_LOG wins over the mountaintools-specific variable.
    for name in ["MOUNTAINTOOLS_LOG_LEVEL", "RUST_LOG"] {
        if let Some(v) = var(name) {
            config.infra.telemetry.log_level = v;
            sources.env_overrides.push(name.to_string());
        }
    }

    if let Some(v) = var("MOUNTAINTOOLS_SERVER_PORT") {
        let port = v.parse().map_err(|_| ConfigError::Parse {
            path: PathBuf::from("MOUNTAINTOOLS_SERVER_PORT"),
            message: format!("'{}' is not a port number", v),
        })?;
        config.infra.server.port = port;
        sources.env_overrides.push("MOUNTAINTOOLS_SERVER_PORT".to_string());
    }

    // A URL + collection pair in the environment defines the "env" remote and
    // makes it the default.
    if var("MOUNTAINTOOLS_URL").is_some() || var("MOUNTAINTOOLS_COLLECTION").is_some() {
        let remote = RemoteConfig::from_vars(&var)?;
        config.remotes.aliases.insert("env".to_string(), remote);
        config.remotes.default = Some("env".to_string());
        sources.env_overrides.push("MOUNTAINTOOLS_URL".to_string());
    }

    if let Some(v) = var("MOUNTAINTOOLS_READONLY") {
        if v.eq_ignore_ascii_case("true") || v == "1" {
            config.policy.local_write = false;
            config.policy.remote_write = false;
            sources.env_overrides.push("MOUNTAINTOOLS_READONLY".to_string());
        }
    }
    Ok(())
}

/// Expand a leading `~` and a leading `$VAR` or `${VAR}` in a path.
/// Unknown variables leave the path as written.
pub fn expand_path(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        return match directories::BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(path[1..].trim_start_matches('/')),
            None => PathBuf::from(path),
        };
    }

    let Some(rest) = path.strip_prefix('$') else {
        return PathBuf::from(path);
    };
    let (name, tail) = match rest.strip_prefix('{') {
        Some(braced) => match braced.split_once('}') {
            Some((name, tail)) => (name, tail),
            None => return PathBuf::from(path),
        },
        None => rest.split_at(rest.find('/').unwrap_or(rest.len())),
    };
    match env::var(name) {
        Ok(value) => PathBuf::from(value).join(tail.trim_start_matches('/')),
        Err(_) => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_path_forms() {
        let home = expand_path("~/.mountaintools");
        assert!(home.ends_with(".mountaintools"));
        assert!(!home.starts_with("~"));

        assert_eq!(expand_path("/data/cache"), PathBuf::from("/data/cache"));
        assert_eq!(
            expand_path("$MOUNTAINTOOLS_SURELY_UNSET/x"),
            PathBuf::from("$MOUNTAINTOOLS_SURELY_UNSET/x")
        );
        assert_eq!(expand_path("${unterminated/x"), PathBuf::from("${unterminated/x"));

        let path = env::var("PATH").unwrap_or_default();
        if !path.is_empty() {
            assert_eq!(expand_path("${PATH}/bin"), PathBuf::from(&path).join("bin"));
            assert_eq!(expand_path("$PATH"), PathBuf::from(&path));
        }
    }

    #[test]
    fn test_merge_tables_nested() {
        let mut base = parse_table(
            "[policy]\nlocal_read = true\nremote_read = false\n[batch]\nclaim_stale_secs = 10\n",
            Path::new("base"),
        )
        .unwrap();
        let overlay = parse_table("[policy]\nremote_read = true\n", Path::new("overlay")).unwrap();

        merge_tables(&mut base, overlay);
        let config = from_table(base, Path::new("merged")).unwrap();

        assert!(config.policy.local_read);
        assert!(config.policy.remote_read);
        assert_eq!(config.batch.claim_stale_secs, 10);
    }

    #[test]
    fn test_cli_path_overrides_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[batch]\npoll_interval_ms = 5").unwrap();

        let files = discover_config_files_with_override(Some(&path));
        assert_eq!(files.last(), Some(&path));

        let config = MountainConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.batch.poll_interval_ms, 5);
    }

    #[test]
    fn test_env_remote_requires_collection() {
        let vars = std::collections::HashMap::from([(
            "MOUNTAINTOOLS_URL",
            "http://kv.example.org:8090".to_string(),
        )]);
        let lookup = |name: &str| vars.get(name).cloned();

        let mut config = MountainConfig::default();
        let err = apply_overrides(&mut config, &mut ConfigSources::default(), lookup).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(name) if name == "MOUNTAINTOOLS_COLLECTION"));
        assert!(config.remotes.default.is_none());
    }

    #[test]
    fn test_env_remote_becomes_default() {
        let vars = std::collections::HashMap::from([
            ("MOUNTAINTOOLS_URL", "http://kv.example.org:8090".to_string()),
            ("MOUNTAINTOOLS_COLLECTION", "spikeforest".to_string()),
            ("MOUNTAINTOOLS_WRITE_TOKEN", "wr1te".to_string()),
        ]);
        let mut config = MountainConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides(&mut config, &mut sources, |name| vars.get(name).cloned()).unwrap();

        let remote = config.remote(None).unwrap().unwrap();
        assert_eq!(remote.collection, "spikeforest");
        assert!(!remote.is_readonly());
        assert!(sources.env_overrides.contains(&"MOUNTAINTOOLS_URL".to_string()));
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse_table("[policy\n", Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
