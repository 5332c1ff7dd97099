//! Manager configuration
//!
//! Built in code or read from TOML:
//!
//! ```toml
//! plugin_roots = ["plugins", "/opt/app/plugins"]
//! hot_reload = true
//! poll_interval = 2.0      # seconds
//! debounce_ms = 200
//! command_prefixes = ["/", "!"]
//! lock_timeout = 5.0       # seconds
//! wasm_fuel = 10000000
//! ```

use crate::wasm::DEFAULT_FUEL;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors in manager configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("At least one plugin root is required")]
    NoPluginRoots,

    #[error("{field} must be a positive duration")]
    NonPositiveDuration { field: &'static str },
}

/// Options recognized by the plugin manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Ordered plugin roots; earlier roots win name conflicts
    pub plugin_roots: Vec<PathBuf>,

    /// Start the reload watcher from `load_all`
    pub hot_reload: bool,

    /// Watcher tick interval
    #[serde(with = "seconds")]
    pub poll_interval: Duration,

    /// Quiet period after a filesystem notification before an early tick
    #[serde(rename = "debounce_ms", with = "millis")]
    pub debounce: Duration,

    /// Characters that mark a message as a command
    pub command_prefixes: Vec<char>,

    /// Bound on registry lock acquisition
    #[serde(with = "seconds")]
    pub lock_timeout: Duration,

    /// Fuel granted to each Wasm guest call
    pub wasm_fuel: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugin_roots: Vec::new(),
            hot_reload: false,
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_millis(200),
            command_prefixes: vec!['/'],
            lock_timeout: Duration::from_secs(5),
            wasm_fuel: DEFAULT_FUEL,
        }
    }
}

impl ManagerConfig {
    /// Config with the given roots and defaults for everything else
    pub fn new(plugin_roots: impl IntoIterator<Item = impl AsRef<Path>>) -> Self {
        Self {
            plugin_roots: plugin_roots
                .into_iter()
                .map(|p| p.as_ref().to_path_buf())
                .collect(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn hot_reload(mut self, enabled: bool) -> Self {
        self.hot_reload = enabled;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn command_prefixes(mut self, prefixes: impl IntoIterator<Item = char>) -> Self {
        self.command_prefixes = prefixes.into_iter().collect();
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn wasm_fuel(mut self, fuel: u64) -> Self {
        self.wasm_fuel = fuel;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugin_roots.is_empty() {
            return Err(ConfigError::NoPluginRoots);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NonPositiveDuration {
                field: "poll_interval",
            });
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::NonPositiveDuration {
                field: "lock_timeout",
            });
        }
        Ok(())
    }
}

/// Durations as fractional seconds
mod seconds {
    use serde::{de::Error, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Durations as whole milliseconds
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
