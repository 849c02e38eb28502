//! Host configuration.
//!
//! Defaults live in [`defaults`], environment variable names and readers in
//! [`env_vars`]. A [`HostConfig`] is assembled from defaults, an optional TOML
//! file and the environment, in that order of precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default values
pub mod defaults {
    /// Plugin directory, relative to the host executable's directory
    pub const PLUGIN_DIR: &str = "plugin";
    /// Module name used when neither the manifest nor the config names a binary
    pub const PLUGIN_NAME: &str = "plugin";
    /// Deployment manifest file name inside the plugin directory
    pub const MANIFEST_FILE: &str = "plugin.toml";
    /// Subdirectory scanned for private dependencies in addition to the plugin directory
    pub const PRIVATE_DEPS_DIR: &str = "deps";
    /// Unload verification attempts before declaring a context stuck
    pub const UNLOAD_MAX_ATTEMPTS: u32 = 10;
    /// Pause between unload verification attempts
    pub const UNLOAD_RETRY_INTERVAL_MS: u64 = 50;
}

/// Environment variable names
pub mod env_vars {
    use std::path::PathBuf;

    use super::defaults;

    pub const PLUGIN_DIR: &str = "ISOLOAD_PLUGIN_DIR";
    pub const PLUGIN_BINARY: &str = "ISOLOAD_PLUGIN_BINARY";
    /// OS path list (`:` or `;` separated) of shared dependency directories
    pub const SHARED_PATH: &str = "ISOLOAD_SHARED_PATH";
    pub const UNLOAD_ATTEMPTS: &str = "ISOLOAD_UNLOAD_ATTEMPTS";
    pub const UNLOAD_INTERVAL_MS: &str = "ISOLOAD_UNLOAD_INTERVAL_MS";
    pub const LOG_JSON: &str = "ISOLOAD_LOG_JSON";
    /// Config file read by the CLI
    pub const CONFIG: &str = "ISOLOAD_CONFIG";

    /// Plugin directory from the environment, if set.
    pub fn plugin_dir() -> Option<PathBuf> {
        std::env::var_os(PLUGIN_DIR).map(PathBuf::from)
    }

    /// Plugin binary from the environment, if set.
    pub fn plugin_binary() -> Option<PathBuf> {
        std::env::var_os(PLUGIN_BINARY).map(PathBuf::from)
    }

    /// Shared search paths from the environment, if set.
    pub fn shared_search_paths() -> Option<Vec<PathBuf>> {
        std::env::var_os(SHARED_PATH).map(|v| std::env::split_paths(&v).collect())
    }

    /// Unload attempts from the environment, or the default.
    pub fn unload_attempts() -> u32 {
        std::env::var(UNLOAD_ATTEMPTS)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::UNLOAD_MAX_ATTEMPTS)
    }

    /// Unload retry interval from the environment, or the default.
    pub fn unload_interval_ms() -> u64 {
        std::env::var(UNLOAD_INTERVAL_MS)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::UNLOAD_RETRY_INTERVAL_MS)
    }

    /// Whether JSON log output was requested.
    pub fn log_json() -> bool {
        std::env::var(LOG_JSON)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Unload verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnloadConfig {
    /// Attempts before a context is reported stuck
    pub max_attempts: u32,
    /// Pause between attempts, in milliseconds
    pub retry_interval_ms: u64,
}

impl Default for UnloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::UNLOAD_MAX_ATTEMPTS,
            retry_interval_ms: defaults::UNLOAD_RETRY_INTERVAL_MS,
        }
    }
}

impl UnloadConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding the module binary, its manifest and private dependencies
    pub plugin_dir: PathBuf,
    /// Module binary, relative to `plugin_dir` unless absolute
    pub plugin_binary: Option<PathBuf>,
    /// Directories searched for shared dependencies
    pub shared_search_paths: Vec<PathBuf>,
    /// Unload verification
    pub unload: UnloadConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        let base = host_base_dir();
        Self {
            plugin_dir: base.join(defaults::PLUGIN_DIR),
            plugin_binary: None,
            shared_search_paths: vec![base],
            unload: UnloadConfig::default(),
        }
    }
}

impl HostConfig {
    /// Config for a specific plugin directory, other fields defaulted.
    pub fn for_plugin_dir(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = env_vars::plugin_dir() {
            self.plugin_dir = dir;
        }
        if let Some(binary) = env_vars::plugin_binary() {
            self.plugin_binary = Some(binary);
        }
        if let Some(paths) = env_vars::shared_search_paths() {
            self.shared_search_paths = paths;
        }
        if std::env::var_os(env_vars::UNLOAD_ATTEMPTS).is_some() {
            self.unload.max_attempts = env_vars::unload_attempts();
        }
        if std::env::var_os(env_vars::UNLOAD_INTERVAL_MS).is_some() {
            self.unload.retry_interval_ms = env_vars::unload_interval_ms();
        }
        self
    }

    /// Resolved module binary path, if configured.
    pub fn binary_path(&self) -> Option<PathBuf> {
        self.plugin_binary
            .as_ref()
            .map(|binary| self.plugin_dir.join(binary))
    }
}

/// Directory of the running executable, falling back to the working directory.
fn host_base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
