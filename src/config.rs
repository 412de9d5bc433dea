//! # Persisted Settings
//!
//! The harness keeps a small JSON document next to the working directory
//! that remembers where the server binaries live and the default sweep
//! parameters. The document is an explicit value: it is loaded once by the
//! driver, passed into the resolver and orchestrator, and only written back
//! when the driver calls [`HarnessConfig::save`] after a mutation.
//!
//! Environment overrides are captured separately in [`EnvOverrides`] so that
//! a path injected through `SERVER_BINARY_PATH` is never persisted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cli::ServerVariant;
use crate::error::ConfigError;

/// Environment variable that prepends a binary to the candidate list.
pub const ENV_SERVER_BINARY_PATH: &str = "SERVER_BINARY_PATH";

/// Environment variable that overrides the default server type.
pub const ENV_SERVER_TYPE: &str = "SERVER_TYPE";

/// Harness settings as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Ordered candidate binaries per server type. Earlier entries win.
    pub server_paths: BTreeMap<ServerVariant, Vec<PathBuf>>,

    pub default_server_type: ServerVariant,

    /// Argv prefix for the benchmark client; client flags are appended.
    pub benchmark_tool: Vec<String>,

    /// Command that builds the benchmark client before a sweep.
    pub benchmark_build: Vec<String>,

    /// Argv prefix for the syscall tracer.
    pub tracer: Vec<String>,

    pub results_dir: PathBuf,
    pub default_connections: Vec<u32>,
    pub default_threads: Vec<u32>,

    /// Seconds per client run.
    pub default_duration: u64,

    pub default_server_address: String,
    pub message_length: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let mut server_paths = BTreeMap::new();
        server_paths.insert(
            ServerVariant::IoUring,
            vec![
                PathBuf::from("./tcpchatserver/build/chat_server"),
                PathBuf::from("/usr/local/bin/tcpchatserver"),
            ],
        );
        server_paths.insert(
            ServerVariant::Epoll,
            vec![
                PathBuf::from("./epollechoserver/build/epoll_server"),
                PathBuf::from("/usr/local/bin/epoll_server"),
            ],
        );

        Self {
            server_paths,
            default_server_type: ServerVariant::IoUring,
            benchmark_tool: to_argv(&["cargo", "run", "--release", "--bin", "bench", "--"]),
            benchmark_build: to_argv(&["cargo", "build", "--release", "--bin", "bench"]),
            tracer: to_argv(&["sudo", "strace"]),
            results_dir: PathBuf::from(crate::defaults::RESULTS_DIR),
            default_connections: vec![10, 50, 100, 500, 1000, 2000],
            default_threads: vec![1, 2, 4, 8, 16],
            default_duration: crate::defaults::DURATION.as_secs(),
            default_server_address: crate::defaults::SERVER_ADDRESS.to_string(),
            message_length: crate::defaults::MESSAGE_LENGTH,
        }
    }
}

/// Outcome of [`HarnessConfig::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    /// The file existed and parsed.
    FromFile(HarnessConfig),
    /// No file yet; defaults were used. The caller decides whether to save.
    Missing(HarnessConfig),
    /// The file exists but could not be used; defaults were used and the
    /// file must not be overwritten implicitly.
    Unusable(HarnessConfig),
}

impl Loaded {
    pub fn into_inner(self) -> HarnessConfig {
        match self {
            Loaded::FromFile(config) | Loaded::Missing(config) | Loaded::Unusable(config) => {
                config
            }
        }
    }
}

impl HarnessConfig {
    /// Read settings from `path` without ever writing to it.
    ///
    /// Missing keys take their default values. A missing file is reported as
    /// [`Loaded::Missing`]; an unreadable or malformed file is an error so the
    /// caller can decide to fall back.
    pub fn load(path: &Path) -> Result<Loaded, ConfigError> {
        if !path.exists() {
            debug!("No settings file at {}", path.display());
            return Ok(Loaded::Missing(Self::default()));
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(Loaded::FromFile(config))
    }

    /// Load settings, falling back to defaults with a warning when the file
    /// cannot be used. The file is left untouched in that case.
    pub fn load_or_default(path: &Path) -> Loaded {
        match Self::load(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("{}; using default settings", e);
                Loaded::Unusable(Self::default())
            }
        }
    }

    /// Write the settings as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        std::fs::write(path, json).map_err(write_err)?;
        info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Candidate binaries for `variant` as stored, without overrides.
    pub fn server_paths(&self, variant: ServerVariant) -> &[PathBuf] {
        self.server_paths
            .get(&variant)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Register `path` as the preferred binary for `variant`.
    ///
    /// An existing identical entry is removed first, so repeating the call
    /// leaves exactly one occurrence, at the front.
    pub fn add_server_path(&mut self, variant: ServerVariant, path: impl Into<PathBuf>) {
        let path = path.into();
        let paths = self.server_paths.entry(variant).or_default();
        paths.retain(|p| p != &path);
        paths.insert(0, path);
    }

    pub fn set_default_variant(&mut self, variant: ServerVariant) {
        self.default_server_type = variant;
    }

    pub fn default_duration(&self) -> Duration {
        Duration::from_secs(self.default_duration)
    }
}

/// Overrides read from the process environment for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub binary_path: Option<PathBuf>,
    pub variant: Option<ServerVariant>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build overrides from an arbitrary lookup. Empty values are ignored and
    /// an unknown `SERVER_TYPE` is reported and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let binary_path = lookup(ENV_SERVER_BINARY_PATH)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let variant = lookup(ENV_SERVER_TYPE).and_then(|tag| {
            let parsed = ServerVariant::from_tag(&tag);
            if parsed.is_none() {
                warn!(
                    "Ignoring {}={:?}: expected one of iouring, epoll",
                    ENV_SERVER_TYPE, tag
                );
            }
            parsed
        });

        Self {
            binary_path,
            variant,
        }
    }

    /// Default variant after applying the environment.
    pub fn default_variant(&self, config: &HarnessConfig) -> ServerVariant {
        self.variant.unwrap_or(config.default_server_type)
    }

    /// Full candidate list for `variant`: the environment path first, then the
    /// stored entries with any duplicate of it removed.
    pub fn candidates(&self, config: &HarnessConfig, variant: ServerVariant) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(env_path) = &self.binary_path {
            candidates.push(env_path.clone());
        }
        candidates.extend(
            config
                .server_paths(variant)
                .iter()
                .filter(|p| Some(*p) != self.binary_path.as_ref())
                .cloned(),
        );
        candidates
    }
}

/// Split a `host:port` address. IPv6 hosts may be bracketed.
pub fn split_address(address: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        address: address.to_string(),
    };
    let (host, port) = address.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

fn to_argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_add_server_path_is_idempotent_and_moves_to_front() {
        let mut config = HarnessConfig::default();
        config.add_server_path(ServerVariant::Epoll, "/opt/epoll_server");
        config.add_server_path(ServerVariant::Epoll, "/opt/epoll_server");

        let paths = config.server_paths(ServerVariant::Epoll);
        assert_eq!(paths[0], PathBuf::from("/opt/epoll_server"));
        assert_eq!(
            paths
                .iter()
                .filter(|p| *p == &PathBuf::from("/opt/epoll_server"))
                .count(),
            1
        );
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn test_add_existing_path_reorders() {
        let mut config = HarnessConfig::default();
        config.add_server_path(ServerVariant::IoUring, "/usr/local/bin/tcpchatserver");
        assert_eq!(
            config.server_paths(ServerVariant::IoUring),
            &[
                PathBuf::from("/usr/local/bin/tcpchatserver"),
                PathBuf::from("./tcpchatserver/build/chat_server"),
            ]
        );
    }

    #[test]
    fn test_load_missing_file_does_not_create_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench_config.json");
        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded, Loaded::Missing(HarnessConfig::default()));
        assert!(!path.exists());
    }

    #[test]
    fn test_save_then_load_preserves_mutations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("bench_config.json");

        let mut config = HarnessConfig::default();
        config.add_server_path(ServerVariant::Epoll, "/srv/epoll");
        config.set_default_variant(ServerVariant::Epoll);
        config.save(&path).unwrap();

        let reloaded = HarnessConfig::load(&path).unwrap().into_inner();
        assert_eq!(reloaded, config);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"epoll\""));
        assert!(text.contains("\"default_server_type\": \"epoll\""));
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench_config.json");
        std::fs::write(&path, r#"{"default_duration": 5, "tracer": ["strace"]}"#).unwrap();

        let config = HarnessConfig::load(&path).unwrap().into_inner();
        assert_eq!(config.default_duration(), Duration::from_secs(5));
        assert_eq!(config.tracer, vec!["strace".to_string()]);
        assert_eq!(config.default_server_address, "127.0.0.1:8080");
        assert_eq!(config.server_paths(ServerVariant::Epoll).len(), 2);
    }

    #[test]
    fn test_malformed_file_falls_back_without_overwriting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench_config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            HarnessConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
        let loaded = HarnessConfig::load_or_default(&path);
        assert_eq!(loaded, Loaded::Unusable(HarnessConfig::default()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_env_overrides_prepend_and_dedup() {
        let env: HashMap<&str, &str> = [
            (ENV_SERVER_BINARY_PATH, "/usr/local/bin/epoll_server"),
            (ENV_SERVER_TYPE, "epoll"),
        ]
        .into_iter()
        .collect();
        let overrides = EnvOverrides::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        let config = HarnessConfig::default();

        assert_eq!(overrides.default_variant(&config), ServerVariant::Epoll);
        assert_eq!(
            overrides.candidates(&config, ServerVariant::Epoll),
            vec![
                PathBuf::from("/usr/local/bin/epoll_server"),
                PathBuf::from("./epollechoserver/build/epoll_server"),
            ]
        );
        // The override never leaks into the stored list.
        assert_eq!(config.server_paths(ServerVariant::Epoll).len(), 2);
    }

    #[test]
    fn test_unknown_env_variant_is_ignored() {
        let overrides = EnvOverrides::from_lookup(|k| {
            (k == ENV_SERVER_TYPE).then(|| "kqueue".to_string())
        });
        assert_eq!(overrides.variant, None);
        assert_eq!(
            overrides.default_variant(&HarnessConfig::default()),
            ServerVariant::IoUring
        );
    }

    #[test]
    fn test_split_address() {
        assert_eq!(
            split_address("127.0.0.1:8080").unwrap(),
            ("127.0.0.1".to_string(), 8080)
        );
        assert_eq!(split_address("[::1]:9000").unwrap(), ("::1".to_string(), 9000));
        assert!(split_address("localhost").is_err());
        assert!(split_address(":8080").is_err());
        assert!(split_address("host:http").is_err());
    }
}
