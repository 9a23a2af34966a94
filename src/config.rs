//! Session Configuration
//!
//! Loaded from `~/.logbridge/config.toml`:
//!
//! ```toml
//! destroy_timeout_ms = 5000
//! event_capacity = 256
//! external_lib_path = "/opt/logbridge/libplugin.so"
//! debug = false
//! max_sessions = 10
//! ```
//!
//! `LOGBRIDGE_DESTROY_TIMEOUT_MS`, `LOGBRIDGE_EXTERNAL_LIB` and
//! `LOGBRIDGE_DEBUG` override the file.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_DESTROY_TIMEOUT: &str = "LOGBRIDGE_DESTROY_TIMEOUT_MS";
pub const ENV_EXTERNAL_LIB: &str = "LOGBRIDGE_EXTERNAL_LIB";
pub const ENV_DEBUG: &str = "LOGBRIDGE_DEBUG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound of the native stop call during destroy
    pub destroy_timeout_ms: u64,
    /// Buffer of each notification broadcast channel; a subscriber more
    /// than this many events behind skips the oldest ones
    pub event_capacity: usize,
    /// Library used by externalCallLib when no path is given
    pub external_lib_path: Option<String>,
    /// Forwarded to the engine at session creation
    pub debug: bool,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            destroy_timeout_ms: 5000,
            event_capacity: 256,
            external_lib_path: None,
            debug: false,
            max_sessions: 10,
        }
    }
}

impl SessionConfig {
    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    pub fn with_destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_external_lib(mut self, path: impl Into<String>) -> Self {
        self.external_lib_path = Some(path.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// `~/.logbridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".logbridge").join("config.toml"))
    }

    /// Load from `path` or the default location, then apply environment
    /// overrides
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(path) => Self::load(&path)?,
                None => Self::default(),
            },
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DESTROY_TIMEOUT) {
            self.destroy_timeout_ms = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_DESTROY_TIMEOUT.to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_EXTERNAL_LIB) {
            if !value.trim().is_empty() {
                self.external_lib_path = Some(value);
            }
        }
        if let Some(value) = lookup(ENV_DEBUG) {
            self.debug = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: ENV_DEBUG.to_string(),
                        value,
                    })
                }
            };
        }
        Ok(self)
    }
}
