//! Bootstrap orchestration.
//!
//! `Bootstrap::initialize` runs the startup flow:
//!
//! 1. platform snapshot (cache hit or fresh detection)
//! 2. required-plugin list (cache hit or computed from the platform)
//! 3. download of missing required plugins, tolerating partial failure
//! 4. discovery of the plugin directory into the catalog
//!
//! Only setup problems and cancellation abort it; registry and download
//! failures are reported as warnings in the [`BootstrapSummary`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::BatchResult;
use crate::cache::{BootstrapCache, SystemClock};
use crate::config::Config;
use crate::error::{DevstrapError, Result};
use crate::platform::{required_plugins, Platform, PlatformDetector};
use crate::plugins::fetch::DEFAULT_MAX_DOWNLOAD_BYTES;
use crate::plugins::{
    ArtifactFetcher, HttpFetcher, PluginManager, RegistryClient, RegistryOptions,
};
use crate::security::validate_registry_url;

/// Outcome of one bootstrap run.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapSummary {
    pub run_id: Uuid,
    pub platform: Platform,
    pub platform_from_cache: bool,
    pub required_plugins: Vec<String>,
    /// Plugins downloaded during this run.
    pub installed: Vec<String>,
    /// Download failures, one per plugin.
    pub install_failures: Vec<BatchResult>,
    pub plugins_loaded: usize,
    pub warnings: Vec<String>,
}

impl BootstrapSummary {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Wires detection, caching, the registry and the plugin catalog together.
pub struct Bootstrap {
    config: Config,
    base_dir: PathBuf,
    plugin_dir: PathBuf,
    cache_path: Option<PathBuf>,
    detector: PlatformDetector,
    cache: Arc<BootstrapCache>,
    fetcher: Arc<dyn ArtifactFetcher>,
    manager: Arc<PluginManager>,
    registry: OnceCell<RegistryClient>,
}

impl Bootstrap {
    /// Build a bootstrap for the real host from `config`.
    pub fn new(config: Config) -> Result<Self> {
        let base_dir = Config::try_dir()?;
        let cache_path = Config::cache_path(&base_dir);
        let cache = Arc::new(BootstrapCache::load(
            &cache_path,
            config.cache_ttl(),
            Arc::new(SystemClock),
        ));
        let fetcher: Arc<dyn ArtifactFetcher> =
            Arc::new(HttpFetcher::new(
                config.download_timeout(),
                DEFAULT_MAX_DOWNLOAD_BYTES,
                config.allow_private_registry,
            )?);

        let mut bootstrap =
            Self::with_parts(config, base_dir, PlatformDetector::host(), fetcher, cache)?;
        bootstrap.cache_path = Some(cache_path);
        Ok(bootstrap)
    }

    /// Build a bootstrap from explicit parts. The cache is not persisted.
    pub fn with_parts(
        config: Config,
        base_dir: PathBuf,
        detector: PlatformDetector,
        fetcher: Arc<dyn ArtifactFetcher>,
        cache: Arc<BootstrapCache>,
    ) -> Result<Self> {
        validate_registry_url(&config.resolve_registry_url(), config.allow_private_registry)
            .map_err(|e| DevstrapError::Config(format!("Invalid plugin registry URL: {}", e)))?;

        let plugin_dir = config.resolve_plugin_dir(&base_dir);
        std::fs::create_dir_all(&plugin_dir).map_err(|e| {
            DevstrapError::Setup(format!(
                "Failed to create plugin directory {}: {}",
                plugin_dir.display(),
                e
            ))
        })?;

        let manager = Arc::new(PluginManager::new(&plugin_dir, config.probe_timeout()));

        Ok(Self {
            config,
            base_dir,
            plugin_dir,
            cache_path: None,
            detector,
            cache,
            fetcher,
            manager,
            registry: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn cache(&self) -> &BootstrapCache {
        &self.cache
    }

    pub fn manager(&self) -> Arc<PluginManager> {
        Arc::clone(&self.manager)
    }

    /// Cached platform, or a fresh detection stored in the cache.
    pub async fn platform(&self) -> Result<Platform> {
        Ok(self.resolve_platform().await?.0)
    }

    /// Registry client for this host's platform key.
    pub async fn registry(&self) -> Result<RegistryClient> {
        if let Some(client) = self.registry.get() {
            return Ok(client.clone());
        }
        let platform = self.platform().await?;
        self.registry_for(&platform)
    }

    fn registry_for(&self, platform: &Platform) -> Result<RegistryClient> {
        self.registry
            .get_or_try_init(|| {
                let options = RegistryOptions {
                    allow_private: self.config.allow_private_registry,
                    download_concurrency: self.config.download_concurrency,
                    download_timeout: self.config.download_timeout(),
                    ..RegistryOptions::default()
                };
                RegistryClient::with_options(
                    &self.config.resolve_registry_url(),
                    &self.plugin_dir,
                    platform.key(),
                    Arc::clone(&self.fetcher),
                    options,
                )
            })
            .cloned()
    }

    /// Run the startup flow.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<BootstrapSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("bootstrap", run_id = %run_id);
        self.run(run_id, cancel).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, cancel: &CancellationToken) -> Result<BootstrapSummary> {
        ensure_live(cancel)?;
        let mut warnings = Vec::new();

        let (platform, platform_from_cache) = self.resolve_platform().await?;
        info!(platform = %platform, key = %platform.key(), cached = platform_from_cache, "Platform");

        let required = match self.cache.get_plugins() {
            Some(required) => required,
            None => {
                let required = required_plugins(&platform);
                self.cache.set_plugins(&required);
                required
            }
        };
        debug!(required = ?required, "Required plugins");
        self.persist_cache();
        ensure_live(cancel)?;

        let mut installed = Vec::new();
        let mut install_failures = Vec::new();
        if self.config.auto_install {
            match self.registry_for(&platform) {
                Ok(registry) => {
                    let report = registry.download_required_plugins(cancel, &required).await;
                    ensure_live(cancel)?;
                    for result in report.sorted() {
                        if result.success {
                            installed.push(result.key);
                        } else {
                            warnings.push(format!(
                                "failed to install '{}': {}",
                                result.key,
                                result.error.as_deref().unwrap_or("unknown error")
                            ));
                            install_failures.push(result);
                        }
                    }
                    if let Some(err) = report.aggregate_error() {
                        warn!(error = %err, "Required plugin installation incomplete");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Registry unavailable, skipping plugin installation");
                    warnings.push(format!("registry unavailable: {}", e));
                }
            }
        } else {
            debug!("Auto-install disabled");
        }

        let plugins_loaded = match self.manager.discover(cancel).await {
            Ok(count) => count,
            Err(DevstrapError::Cancelled) => return Err(DevstrapError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Plugin discovery failed");
                warnings.push(format!("plugin discovery failed: {}", e));
                0
            }
        };

        for name in &required {
            if self.manager.get_plugin(name).await.is_none() {
                warnings.push(format!("required plugin '{}' is not available", name));
            }
        }

        info!(
            plugins = plugins_loaded,
            installed = installed.len(),
            warnings = warnings.len(),
            "Bootstrap complete"
        );

        Ok(BootstrapSummary {
            run_id,
            platform,
            platform_from_cache,
            required_plugins: required,
            installed,
            install_failures,
            plugins_loaded,
            warnings,
        })
    }

    async fn resolve_platform(&self) -> Result<(Platform, bool)> {
        if let Some(platform) = self.cache.get_platform() {
            return Ok((platform, true));
        }

        let detector = self.detector.clone();
        let platform = tokio::task::spawn_blocking(move || detector.detect())
            .await
            .map_err(|e| DevstrapError::Setup(format!("Platform detection failed: {}", e)))?;
        self.cache.set_platform(&platform);
        Ok((platform, false))
    }

    fn persist_cache(&self) {
        if let Some(path) = self.cache_path.as_deref() {
            if let Err(e) = self.cache.save(path) {
                warn!(path = %path.display(), error = %e, "Failed to persist bootstrap cache");
            }
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(DevstrapError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::platform::system::fake::ubuntu_gnome;
    use crate::plugins::fetch::MockArtifactFetcher;
    use crate::plugins::loader::testing::{describe_json, script_plugin};
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    const REGISTRY: &str = "https://plugins.example.com/registry.json";

    fn config(auto_install: bool) -> Config {
        Config {
            plugin_registry_url: Some(REGISTRY.to_string()),
            auto_install,
            ..Config::default()
        }
    }

    fn detector() -> PlatformDetector {
        let (os, fs) = ubuntu_gnome();
        PlatformDetector::new(Arc::new(os), Arc::new(fs))
    }

    fn cache() -> Arc<BootstrapCache> {
        Arc::new(BootstrapCache::new(
            chrono::Duration::hours(24),
            Arc::new(ManualClock::new(chrono::Utc::now())),
        ))
    }

    fn bootstrap(home: &TempDir, cfg: Config, fetcher: MockArtifactFetcher) -> Bootstrap {
        Bootstrap::with_parts(
            cfg,
            home.path().to_path_buf(),
            detector(),
            Arc::new(fetcher),
            cache(),
        )
        .unwrap()
    }

    /// Registry serving `(name, script)` artifacts for linux-amd64.
    fn registry_fetcher(plugins: Vec<(&'static str, String)>) -> MockArtifactFetcher {
        let mut manifest = serde_json::Map::new();
        for (name, script) in &plugins {
            let checksum = format!("sha256:{}", hex::encode(Sha256::digest(script.as_bytes())));
            manifest.insert(
                name.to_string(),
                serde_json::json!({
                    "version": "1.0.0",
                    "description": format!("{} plugin", name),
                    "platforms": {
                        "linux-amd64": {
                            "url": format!("https://cdn.example.com/{}", name),
                            "checksum": checksum
                        }
                    }
                }),
            );
        }
        let manifest = serde_json::to_vec(&manifest).unwrap();

        let mut fetcher = MockArtifactFetcher::new();
        fetcher.expect_fetch_bytes().returning(move |url| {
            if url == REGISTRY {
                return Ok(manifest.clone());
            }
            plugins
                .iter()
                .find(|(name, _)| url == format!("https://cdn.example.com/{}", name))
                .map(|(_, script)| script.clone().into_bytes())
                .ok_or_else(|| DevstrapError::Network(format!("404 {}", url)))
        });
        fetcher
    }

    // Empty plugin directory: bootstrap succeeds with an empty catalog.
    #[tokio::test]
    async fn test_empty_plugin_dir() {
        let home = TempDir::new().unwrap();
        let mut fetcher = MockArtifactFetcher::new();
        fetcher.expect_fetch_bytes().times(0);
        let bootstrap = bootstrap(&home, config(false), fetcher);

        let summary = bootstrap
            .initialize(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.plugins_loaded, 0);
        assert!(bootstrap.manager().list_plugins().await.is_empty());
        assert_eq!(summary.platform.to_string(), "ubuntu 22.04 (linux amd64)");
        assert_eq!(summary.platform.key(), "linux-amd64");
        assert_eq!(
            summary.required_plugins,
            vec!["apt", "gnome", "mise", "pip"]
        );
        assert!(home.path().join("plugins").is_dir());
    }

    // Install `foo` for linux-amd64, then discovery lists foo@1.0.0.
    #[tokio::test]
    async fn test_install_then_discover() {
        let home = TempDir::new().unwrap();
        let script = script_plugin(&describe_json("foo", "1.0.0"), "exit 0");
        let bootstrap = bootstrap(&home, config(false), registry_fetcher(vec![("foo", script)]));

        let registry = bootstrap.registry().await.unwrap();
        assert_eq!(registry.platform_key(), "linux-amd64");
        let path = registry
            .download_plugin("foo", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, bootstrap.plugin_dir().join("foo"));

        let manager = bootstrap.manager();
        manager.discover(&CancellationToken::new()).await.unwrap();
        let labels: Vec<String> = manager
            .list_plugins()
            .await
            .iter()
            .map(|p| p.label())
            .collect();
        assert_eq!(labels, vec!["foo@1.0.0"]);

        manager
            .execute_plugin("foo", &["install".to_string()])
            .await
            .unwrap();
    }

    // A malicious name never reaches the network or the disk.
    #[tokio::test]
    async fn test_malicious_name_rejected() {
        let home = TempDir::new().unwrap();
        let mut fetcher = MockArtifactFetcher::new();
        fetcher.expect_fetch_bytes().times(0);
        let bootstrap = bootstrap(&home, config(false), fetcher);
        let before: Vec<_> = std::fs::read_dir(bootstrap.plugin_dir()).unwrap().collect();

        let registry = bootstrap.registry().await.unwrap();
        let err = registry
            .download_plugin("../../etc/passwd", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DevstrapError::Validation(_)));
        let after: Vec<_> = std::fs::read_dir(bootstrap.plugin_dir()).unwrap().collect();
        assert_eq!(before.len(), after.len());
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_auto_install_tolerates_partial_failure() {
        let home = TempDir::new().unwrap();
        let apt = script_plugin(&describe_json("apt", "1.0.0"), "exit 0");
        let mise = script_plugin(&describe_json("mise", "1.0.0"), "exit 0");
        let bootstrap = bootstrap(
            &home,
            config(true),
            registry_fetcher(vec![("apt", apt), ("mise", mise)]),
        );

        let summary = bootstrap
            .initialize(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.installed, vec!["apt", "mise"]);
        let failed: Vec<&str> = summary
            .install_failures
            .iter()
            .map(|r| r.key.as_str())
            .collect();
        assert_eq!(failed, vec!["gnome", "pip"]);
        assert_eq!(summary.plugins_loaded, 2);
        assert!(summary.is_degraded());
        assert!(summary
            .warnings
            .iter()
            .any(|w| w.contains("'gnome' is not available")));
    }

    #[tokio::test]
    async fn test_registry_down_is_not_fatal() {
        let home = TempDir::new().unwrap();
        let mut fetcher = MockArtifactFetcher::new();
        fetcher
            .expect_fetch_bytes()
            .returning(|_| Err(DevstrapError::Network("connection refused".into())));
        let bootstrap = bootstrap(&home, config(true), fetcher);

        let summary = bootstrap
            .initialize(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.plugins_loaded, 0);
        assert_eq!(summary.install_failures.len(), 4);
    }

    #[tokio::test]
    async fn test_second_run_uses_cache() {
        let home = TempDir::new().unwrap();
        let bootstrap = bootstrap(&home, config(false), MockArtifactFetcher::new());

        let first = bootstrap
            .initialize(&CancellationToken::new())
            .await
            .unwrap();
        let second = bootstrap
            .initialize(&CancellationToken::new())
            .await
            .unwrap();

        assert!(!first.platform_from_cache);
        assert!(second.platform_from_cache);
        assert_eq!(first.platform, second.platform);
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let home = TempDir::new().unwrap();
        let bootstrap = bootstrap(&home, config(true), MockArtifactFetcher::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bootstrap.initialize(&cancel).await.unwrap_err();
        assert!(matches!(err, DevstrapError::Cancelled));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_registry_url_is_config_error() {
        let home = TempDir::new().unwrap();
        let cfg = Config {
            plugin_registry_url: Some("ftp://plugins.example.com/r.json".to_string()),
            ..Config::default()
        };
        let err = Bootstrap::with_parts(
            cfg,
            home.path().to_path_buf(),
            detector(),
            Arc::new(MockArtifactFetcher::new()),
            cache(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DevstrapError::Config(_)));
    }

    #[test]
    fn test_uncreatable_plugin_dir_is_setup_error() {
        let home = TempDir::new().unwrap();
        let blocker = home.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let cfg = Config {
            plugin_dir: Some(blocker.join("plugins").display().to_string()),
            ..config(false)
        };

        let err = Bootstrap::with_parts(
            cfg,
            home.path().to_path_buf(),
            detector(),
            Arc::new(MockArtifactFetcher::new()),
            cache(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DevstrapError::Setup(_)));
        assert!(err.is_fatal());
    }
}
