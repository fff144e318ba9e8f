//! Installed-plugin catalog.
//!
//! `PluginManager` owns the name→plugin map built by discovery, answers
//! lookups with clones, runs plugin processes and uninstalls plugin files.
//! Discovery builds a complete new map before swapping it in, so readers see
//! either the old catalog or the new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DevstrapError, Result};
use crate::security::{plugin_path, validate_arguments, validate_plugin_name};

use super::loader::{self, DEFAULT_PROBE_TIMEOUT};
use super::types::{InstalledPlugin, Plugin, PluginInfo};

/// Catalog of installed plugins.
pub struct PluginManager {
    plugin_dir: PathBuf,
    probe_timeout: Duration,
    plugins: RwLock<HashMap<String, InstalledPlugin>>,
}

impl PluginManager {
    pub fn new(plugin_dir: impl Into<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            probe_timeout,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults(plugin_dir: impl Into<PathBuf>) -> Self {
        Self::new(plugin_dir, DEFAULT_PROBE_TIMEOUT)
    }

    /// Rebuild the catalog from the plugin directory. Returns the number of
    /// plugins loaded.
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<usize> {
        let discovered =
            loader::discover_plugins(&self.plugin_dir, self.probe_timeout, cancel).await?;
        let count = discovered.len();

        *self.plugins.write().await = discovered;

        info!(dir = %self.plugin_dir.display(), plugins = count, "Plugin catalog rebuilt");
        Ok(count)
    }

    /// All plugins, sorted by name.
    pub async fn list_plugins(&self) -> Vec<InstalledPlugin> {
        let mut plugins: Vec<InstalledPlugin> =
            self.plugins.read().await.values().cloned().collect();
        plugins.sort_by(|a, b| a.name().cmp(b.name()));
        plugins
    }

    pub async fn get_plugin(&self, name: &str) -> Option<InstalledPlugin> {
        self.plugins.read().await.get(name).cloned()
    }

    /// Dispatchable handle for `name`.
    pub async fn plugin(&self, name: &str) -> Result<ExecutablePlugin> {
        validate_plugin_name(name)?;
        self.get_plugin(name)
            .await
            .map(ExecutablePlugin::new)
            .ok_or_else(|| DevstrapError::PluginNotFound(name.to_string()))
    }

    /// Returns the number of loaded plugins.
    ///
    /// # Example
    ///
    /// ```
    /// use devstrap::plugins::PluginManager;
    ///
    /// # tokio_test::block_on(async {
    /// let manager = PluginManager::with_defaults("/nonexistent/devstrap/plugins");
    /// assert_eq!(manager.plugin_count().await, 0);
    /// # })
    /// ```
    pub async fn plugin_count(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Run plugin `name` with `args` and wait for it to exit.
    pub async fn execute_plugin(&self, name: &str, args: &[String]) -> Result<()> {
        self.execute_plugin_with_cancel(name, args, &CancellationToken::new())
            .await
    }

    pub async fn execute_plugin_with_cancel(
        &self,
        name: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        validate_plugin_name(name)?;
        validate_arguments(args)?;

        let plugin = self
            .get_plugin(name)
            .await
            .ok_or_else(|| DevstrapError::PluginNotFound(name.to_string()))?;

        run_plugin_process(plugin.path(), name, args, cancel).await
    }

    /// Delete the plugin file and drop its catalog entry.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        let path = plugin_path(&self.plugin_dir, name)?;

        let removed_file = match std::fs::remove_file(path.as_path()) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(DevstrapError::Execution(format!(
                    "Failed to remove {}: {}",
                    path.as_path().display(),
                    e
                )))
            }
        };
        let removed_entry = self.plugins.write().await.remove(name).is_some();

        if !removed_file && !removed_entry {
            return Err(DevstrapError::PluginNotFound(name.to_string()));
        }

        info!(plugin = %name, "Uninstalled plugin");
        Ok(())
    }
}

/// Spawn a plugin with inherited stdio and map its exit status.
async fn run_plugin_process(
    path: &Path,
    name: &str,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    debug!(plugin = %name, args = args.len(), "Executing plugin");

    let mut child = loader::spawn(&mut cmd)
        .await
        .map_err(|e| DevstrapError::Execution(format!("Failed to start '{}': {}", name, e)))?;

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };

    let Some(status) = status else {
        if let Err(e) = child.kill().await {
            warn!(plugin = %name, error = %e, "Failed to kill cancelled plugin");
        }
        return Err(DevstrapError::Cancelled);
    };

    let status = status
        .map_err(|e| DevstrapError::Execution(format!("Failed to wait for '{}': {}", name, e)))?;

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(DevstrapError::PluginExit {
            plugin: name.to_string(),
            code,
        }),
        None => Err(DevstrapError::Execution(format!(
            "'{}' was terminated by a signal",
            name
        ))),
    }
}

/// A discovered plugin executable.
#[derive(Debug, Clone)]
pub struct ExecutablePlugin {
    installed: InstalledPlugin,
}

impl ExecutablePlugin {
    pub fn new(installed: InstalledPlugin) -> Self {
        Self { installed }
    }

    pub fn installed(&self) -> &InstalledPlugin {
        &self.installed
    }
}

#[async_trait]
impl Plugin for ExecutablePlugin {
    fn info(&self) -> &PluginInfo {
        &self.installed.info
    }

    async fn execute(
        &self,
        command: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(command.to_string());
        argv.extend_from_slice(args);
        validate_arguments(&argv)?;

        run_plugin_process(self.installed.path(), self.installed.name(), &argv, cancel).await
    }
}
