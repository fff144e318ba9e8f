//! Configuration for devstrap
//!
//! Settings live in `~/.devstrap/config.json`; every key is optional.
//! Environment variables take precedence over the file:
//!
//! | Variable                        | Effect                                  |
//! |---------------------------------|-----------------------------------------|
//! | `DEVSTRAP_HOME`                 | Base directory instead of `~/.devstrap` |
//! | `DEVSTRAP_PLUGIN_REGISTRY_URL`  | Registry manifest URL                   |
//! | `DEVSTRAP_PLUGIN_DIR`           | Plugin directory                        |
//! | `DEVSTRAP_OFFLINE`              | Truthy value disables auto-install      |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DevstrapError, Result};
use crate::plugins::DEFAULT_REGISTRY_URL;

pub const ENV_HOME: &str = "DEVSTRAP_HOME";
pub const ENV_REGISTRY_URL: &str = "DEVSTRAP_PLUGIN_REGISTRY_URL";
pub const ENV_PLUGIN_DIR: &str = "DEVSTRAP_PLUGIN_DIR";
pub const ENV_OFFLINE: &str = "DEVSTRAP_OFFLINE";

/// A century; larger values would overflow `chrono::Duration`.
const MAX_CACHE_TTL_HOURS: u64 = 24 * 365 * 100;

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry manifest URL. `None` uses the built-in default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_registry_url: Option<String>,

    /// Plugin directory. `None` uses `<base>/plugins`. A leading `~/` is
    /// expanded to the home directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_dir: Option<String>,

    /// Download missing required plugins during bootstrap.
    pub auto_install: bool,

    /// Parallel plugin downloads (clamped to 1..=10).
    pub download_concurrency: usize,

    pub download_timeout_secs: u64,

    pub probe_timeout_secs: u64,

    /// Lifetime of cached platform and required-plugin data. `0` disables
    /// caching.
    pub cache_ttl_hours: u64,

    /// Allow a registry or artifact URL on a loopback/private host.
    pub allow_private_registry: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin_registry_url: None,
            plugin_dir: None,
            auto_install: true,
            download_concurrency: 4,
            download_timeout_secs: 120,
            probe_timeout_secs: 5,
            cache_ttl_hours: 24,
            allow_private_registry: false,
        }
    }
}

impl Config {
    /// Base directory, `$DEVSTRAP_HOME` or `~/.devstrap`.
    pub fn try_dir() -> Result<PathBuf> {
        if let Some(home) = std::env::var_os(ENV_HOME).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        dirs::home_dir()
            .map(|home| home.join(".devstrap"))
            .ok_or_else(|| DevstrapError::Setup("Could not determine home directory".into()))
    }

    /// Like [`Config::try_dir`], falling back to `./.devstrap`.
    pub fn dir() -> PathBuf {
        Self::try_dir().unwrap_or_else(|_| PathBuf::from(".devstrap"))
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load the settings file and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a settings file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            DevstrapError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| DevstrapError::Config(format!("Invalid {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply `DEVSTRAP_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_REGISTRY_URL).filter(|v| !v.trim().is_empty()) {
            self.plugin_registry_url = Some(url.trim().to_string());
        }
        if let Some(dir) = lookup(ENV_PLUGIN_DIR).filter(|v| !v.trim().is_empty()) {
            self.plugin_dir = Some(dir);
        }
        if let Some(offline) = lookup(ENV_OFFLINE) {
            if is_truthy(&offline) {
                self.auto_install = false;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_timeout_secs == 0 {
            return Err(DevstrapError::Config(
                "download_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.probe_timeout_secs == 0 {
            return Err(DevstrapError::Config(
                "probe_timeout_secs must be greater than 0".into(),
            ));
        }
        if !(1..=10).contains(&self.download_concurrency) {
            warn!(
                download_concurrency = self.download_concurrency,
                "download_concurrency outside 1..=10 will be clamped"
            );
        }
        Ok(())
    }

    /// Registry URL: environment, then settings file, then the default.
    pub fn resolve_registry_url(&self) -> String {
        self.plugin_registry_url
            .clone()
            .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string())
    }

    pub fn resolve_plugin_dir(&self, base: &Path) -> PathBuf {
        match self.plugin_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => base.join("plugins"),
        }
    }

    pub fn cache_path(base: &Path) -> PathBuf {
        base.join("cache").join("bootstrap.json")
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours.min(MAX_CACHE_TTL_HOURS) as i64)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
