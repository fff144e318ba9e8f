//! Plugin registry client for devstrap
//!
//! The registry is a single JSON manifest mapping plugin names to metadata
//! and per-platform artifacts:
//!
//! ```json
//! {
//!   "apt": {
//!     "version": "1.2.0",
//!     "description": "Debian package manager",
//!     "tags": ["package-manager"],
//!     "platforms": {
//!       "linux-amd64": {"url": "https://…/apt-linux-amd64", "checksum": "sha256:…"}
//!     }
//!   }
//! }
//! ```
//!
//! `RegistryClient` caches the manifest in memory, answers searches, and
//! installs artifacts: fetch, verify SHA-256, write to a temp file in the
//! plugin directory, then rename over `<plugin_dir>/<name>`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchReport, BatchRunner};
use crate::error::{DevstrapError, Result};
use crate::security::{plugin_path, validate_plugin_name, validate_registry_url};

use super::fetch::ArtifactFetcher;
use super::lock::InstallLock;
use super::types::{InstalledPlugin, PluginMetadata};

/// Registry used when neither the environment nor the settings file name one.
pub const DEFAULT_REGISTRY_URL: &str =
    "https://raw.githubusercontent.com/devstrap/plugin-registry/main/registry.json";

type Manifest = BTreeMap<String, PluginMetadata>;

/// Tunables for a [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Permit loopback/private hosts for the registry and artifact URLs.
    pub allow_private: bool,
    /// Parallel downloads in `download_required_plugins`.
    pub download_concurrency: usize,
    /// Per-download timeout in `download_required_plugins`.
    pub download_timeout: Duration,
    /// How long an install waits on another install of the same plugin.
    pub lock_wait: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            allow_private: false,
            download_concurrency: 4,
            download_timeout: Duration::from_secs(120),
            lock_wait: Duration::from_secs(30),
        }
    }
}

/// Client for the plugin registry. Cheap to clone; clones share the cached
/// manifest.
#[derive(Clone)]
pub struct RegistryClient {
    registry_url: reqwest::Url,
    plugin_dir: PathBuf,
    platform_key: String,
    fetcher: Arc<dyn ArtifactFetcher>,
    options: RegistryOptions,
    manifest: Arc<RwLock<Option<Arc<Manifest>>>>,
}

impl RegistryClient {
    pub fn new(
        registry_url: &str,
        plugin_dir: impl Into<PathBuf>,
        platform_key: impl Into<String>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self> {
        Self::with_options(
            registry_url,
            plugin_dir,
            platform_key,
            fetcher,
            RegistryOptions::default(),
        )
    }

    pub fn with_options(
        registry_url: &str,
        plugin_dir: impl Into<PathBuf>,
        platform_key: impl Into<String>,
        fetcher: Arc<dyn ArtifactFetcher>,
        options: RegistryOptions,
    ) -> Result<Self> {
        let registry_url = validate_registry_url(registry_url, options.allow_private)?;
        Ok(Self {
            registry_url,
            plugin_dir: plugin_dir.into(),
            platform_key: platform_key.into(),
            fetcher,
            options,
            manifest: Arc::new(RwLock::new(None)),
        })
    }

    pub fn registry_url(&self) -> &str {
        self.registry_url.as_str()
    }

    pub fn platform_key(&self) -> &str {
        &self.platform_key
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// The registry manifest, fetched on first use.
    pub async fn get_available_plugins(&self) -> Result<Vec<PluginMetadata>> {
        let manifest = self.manifest().await?;
        Ok(manifest.values().cloned().collect())
    }

    /// Refetch the manifest. Returns the number of plugins advertised.
    pub async fn update_registry(&self) -> Result<usize> {
        let manifest = self.fetch_manifest().await?;
        let count = manifest.len();
        *self.manifest.write().await = Some(Arc::new(manifest));
        info!(registry = %self.registry_url, plugins = count, "Registry updated");
        Ok(count)
    }

    /// Case-insensitive search over name, description and tags. An empty
    /// query returns every plugin.
    pub async fn search_plugins(&self, query: &str) -> Result<Vec<PluginMetadata>> {
        let needle = query.trim().to_lowercase();
        let manifest = self.manifest().await?;
        Ok(manifest
            .values()
            .filter(|meta| meta.matches(&needle))
            .cloned()
            .collect())
    }

    pub async fn plugin_metadata(&self, name: &str) -> Result<PluginMetadata> {
        validate_plugin_name(name)?;
        let manifest = self.manifest().await?;
        manifest
            .get(name)
            .cloned()
            .ok_or_else(|| DevstrapError::PluginNotFound(name.to_string()))
    }

    /// Installed plugins whose registry version differs from the local one.
    pub async fn outdated(&self, installed: &[InstalledPlugin]) -> Result<Vec<String>> {
        let manifest = self.manifest().await?;
        Ok(installed
            .iter()
            .filter(|plugin| {
                manifest
                    .get(plugin.name())
                    .is_some_and(|meta| meta.version != plugin.version())
            })
            .map(|plugin| plugin.name().to_string())
            .collect())
    }

    /// Download, verify and install `name` for this client's platform key.
    /// Returns the installed path.
    pub async fn download_plugin(&self, name: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        validate_plugin_name(name)?;

        let meta = self.plugin_metadata(name).await?;
        let artifact = meta
            .artifact_for(&self.platform_key)
            .ok_or_else(|| DevstrapError::PlatformUnsupported {
                plugin: name.to_string(),
                platform: self.platform_key.clone(),
            })?;
        let url = validate_registry_url(&artifact.url, self.options.allow_private)?;
        let target = plugin_path(&self.plugin_dir, name)?;

        tokio::fs::create_dir_all(&self.plugin_dir)
            .await
            .map_err(|e| {
                DevstrapError::Setup(format!(
                    "Failed to create plugin directory {}: {}",
                    self.plugin_dir.display(),
                    e
                ))
            })?;

        let _lock = InstallLock::acquire(&self.plugin_dir, name, self.options.lock_wait).await?;

        debug!(plugin = %name, url = %url, "Downloading plugin");
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DevstrapError::Cancelled),
            res = self.fetcher.fetch_bytes(url.as_str()) => res?,
        };

        verify_checksum(name, &artifact.checksum, &bytes)?;
        let size = bytes.len();
        let plugin_dir = self.plugin_dir.clone();
        let target = target.into_path_buf();
        let installed = target.clone();
        tokio::task::spawn_blocking(move || install_artifact(&plugin_dir, &installed, &bytes))
            .await
            .map_err(|e| DevstrapError::Setup(format!("Install of '{}' failed: {}", name, e)))??;

        info!(
            plugin = %name,
            version = %meta.version,
            platform = %self.platform_key,
            bytes = size,
            "Installed plugin"
        );
        Ok(target)
    }

    /// Install every name in `names` not already present on disk. Failures
    /// are logged and reported, never raised.
    pub async fn download_required_plugins(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> BatchReport {
        let missing: Vec<String> = names
            .iter()
            .filter(|name| {
                plugin_path(&self.plugin_dir, name)
                    .map(|p| !p.as_path().exists())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        if missing.is_empty() {
            debug!("All required plugins already installed");
            return BatchReport::default();
        }
        info!(plugins = ?missing, "Installing required plugins");

        let runner = BatchRunner::new(
            self.options.download_concurrency,
            self.options.download_timeout,
        );
        let client = self.clone();
        let report = runner
            .run(cancel, missing, move |name: String, token| {
                let client = client.clone();
                async move { client.download_plugin(&name, &token).await.map(|_| ()) }
            })
            .await;

        for failure in report.failures() {
            warn!(
                plugin = %failure.key,
                error = failure.error.as_deref().unwrap_or("unknown"),
                "Failed to install required plugin"
            );
        }
        report
    }

    async fn manifest(&self) -> Result<Arc<Manifest>> {
        if let Some(manifest) = self.manifest.read().await.as_ref() {
            return Ok(Arc::clone(manifest));
        }

        let mut slot = self.manifest.write().await;
        // Another task may have filled it while we waited for the write lock.
        if let Some(manifest) = slot.as_ref() {
            return Ok(Arc::clone(manifest));
        }
        let manifest = Arc::new(self.fetch_manifest().await?);
        *slot = Some(Arc::clone(&manifest));
        Ok(manifest)
    }

    async fn fetch_manifest(&self) -> Result<Manifest> {
        let bytes = self.fetcher.fetch_bytes(self.registry_url.as_str()).await?;
        parse_manifest(&bytes)
    }
}

/// Parse a registry manifest. Entries with invalid names or malformed
/// bodies are dropped with a warning.
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| DevstrapError::Network(format!("Malformed registry manifest: {}", e)))?;

    let mut manifest = Manifest::new();
    for (name, value) in raw {
        if let Err(e) = validate_plugin_name(&name) {
            warn!(plugin = %name, error = %e, "Skipping registry entry with invalid name");
            continue;
        }
        match serde_json::from_value::<PluginMetadata>(value) {
            Ok(mut meta) => {
                meta.name = name.clone();
                manifest.insert(name, meta);
            }
            Err(e) => {
                warn!(plugin = %name, error = %e, "Skipping malformed registry entry");
            }
        }
    }
    Ok(manifest)
}

/// Compare `bytes` against a `sha256:<hex>` or bare-hex digest.
pub fn verify_checksum(name: &str, expected: &str, bytes: &[u8]) -> Result<()> {
    let expected = expected.trim();
    let expected_hex = match expected.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &expected[7..],
        _ => expected,
    }
    .to_ascii_lowercase();
    let actual = hex::encode(Sha256::digest(bytes));

    if expected_hex.is_empty() || expected_hex != actual {
        return Err(DevstrapError::ChecksumMismatch {
            plugin: name.to_string(),
            expected: if expected.is_empty() {
                "<missing>".to_string()
            } else {
                expected.to_string()
            },
            actual: format!("sha256:{}", actual),
        });
    }
    Ok(())
}

fn install_artifact(plugin_dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(plugin_dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755))?;
    }

    tmp.persist(target).map_err(|e| {
        DevstrapError::Io(std::io::Error::new(
            e.error.kind(),
            format!("Failed to install {}: {}", target.display(), e.error),
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::fetch::MockArtifactFetcher;
    use serde_json::json;
    use tempfile::TempDir;

    const REGISTRY: &str = "https://plugins.example.com/registry.json";

    fn sha(bytes: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
    }

    fn manifest_json(artifact: &[u8]) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "foo": {
                "version": "1.0.0",
                "description": "Foo tools",
                "tags": ["dev"],
                "platforms": {
                    "linux-amd64": {"url": "https://cdn.example.com/foo", "checksum": sha(artifact)}
                }
            },
            "apt": {
                "version": "2.0.0",
                "description": "Debian packages",
                "tags": ["package-manager"],
                "platforms": {}
            },
            "../evil": {"version": "1", "platforms": {}},
            "broken": {"description": "missing version"}
        }))
        .unwrap()
    }

    fn fetcher_serving(artifact: &'static [u8]) -> MockArtifactFetcher {
        let mut fetcher = MockArtifactFetcher::new();
        fetcher
            .expect_fetch_bytes()
            .withf(|url| url == REGISTRY)
            .returning(move |_| Ok(manifest_json(artifact)));
        fetcher
            .expect_fetch_bytes()
            .withf(|url| url == "https://cdn.example.com/foo")
            .returning(move |_| Ok(artifact.to_vec()));
        fetcher
    }

    fn client(dir: &Path, fetcher: MockArtifactFetcher) -> RegistryClient {
        RegistryClient::new(REGISTRY, dir, "linux-amd64", Arc::new(fetcher)).unwrap()
    }

    #[test]
    fn test_rejects_private_registry_url() {
        let err = RegistryClient::new(
            "http://127.0.0.1:8080/registry.json",
            "/tmp/plugins",
            "linux-amd64",
            Arc::new(MockArtifactFetcher::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DevstrapError::Validation(_)));

        let options = RegistryOptions {
            allow_private: true,
            ..RegistryOptions::default()
        };
        assert!(RegistryClient::with_options(
            "http://127.0.0.1:8080/registry.json",
            "/tmp/plugins",
            "linux-amd64",
            Arc::new(MockArtifactFetcher::new()),
            options,
        )
        .is_ok());
    }

    #[test]
    fn test_parse_manifest_drops_bad_entries() {
        let manifest = parse_manifest(&manifest_json(b"x")).unwrap();
        let names: Vec<&str> = manifest.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["apt", "foo"]);
        assert_eq!(manifest["foo"].name, "foo");
    }

    #[test]
    fn test_parse_manifest_rejects_non_object() {
        let err = parse_manifest(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, DevstrapError::Network(_)));
    }

    #[test]
    fn test_verify_checksum_formats() {
        let bytes = b"plugin-binary";
        let hex = hex::encode(Sha256::digest(bytes));
        assert!(verify_checksum("foo", &format!("sha256:{}", hex), bytes).is_ok());
        assert!(verify_checksum("foo", &format!("SHA256:{}", hex.to_uppercase()), bytes).is_ok());
        assert!(verify_checksum("foo", &hex, bytes).is_ok());

        let err = verify_checksum("foo", "sha256:deadbeef", bytes).unwrap_err();
        assert!(matches!(err, DevstrapError::ChecksumMismatch { .. }));
        let err = verify_checksum("foo", "", bytes).unwrap_err();
        assert!(err.to_string().contains("<missing>"));
    }

    #[tokio::test]
    async fn test_manifest_fetched_once_and_searchable() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockArtifactFetcher::new();
        fetcher
            .expect_fetch_bytes()
            .times(1)
            .returning(|_| Ok(manifest_json(b"x")));
        let client = client(dir.path(), fetcher);

        assert_eq!(client.get_available_plugins().await.unwrap().len(), 2);
        let hits = client.search_plugins("PACKAGE").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "apt");
        assert_eq!(client.search_plugins("").await.unwrap().len(), 2);
        assert!(client.search_plugins("nothing-matches").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_registry_refetches() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockArtifactFetcher::new();
        fetcher
            .expect_fetch_bytes()
            .times(2)
            .returning(|_| Ok(manifest_json(b"x")));
        let client = client(dir.path(), fetcher);

        client.get_available_plugins().await.unwrap();
        assert_eq!(client.update_registry().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_registry_unreachable_is_network_error() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockArtifactFetcher::new();
        fetcher
            .expect_fetch_bytes()
            .returning(|_| Err(DevstrapError::Network("connection refused".into())));
        let client = client(dir.path(), fetcher);

        let err = client.get_available_plugins().await.unwrap_err();
        assert!(matches!(err, DevstrapError::Network(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_creates_missing_plugin_dir() {
        let dir = TempDir::new().unwrap();
        let plugin_dir = dir.path().join("nested").join("plugins");
        let client = client(&plugin_dir, fetcher_serving(b"#!/bin/sh\nexit 0\n"));

        let path = client
            .download_plugin("foo", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, plugin_dir.join("foo"));
        assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\nexit 0\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_installs_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), fetcher_serving(b"#!/bin/sh\nexit 0\n"));

        let path = client
            .download_plugin("foo", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("foo"));
        assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\nexit 0\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        // no lock or temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_download_checksum_mismatch_leaves_dir_untouched() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockArtifactFetcher::new();
        fetcher
            .expect_fetch_bytes()
            .withf(|url| url == REGISTRY)
            .returning(|_| Ok(manifest_json(b"expected")));
        fetcher
            .expect_fetch_bytes()
            .withf(|url| url == "https://cdn.example.com/foo")
            .returning(|_| Ok(b"tampered".to_vec()));
        let client = client(dir.path(), fetcher);

        let err = client
            .download_plugin("foo", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DevstrapError::ChecksumMismatch { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_unknown_and_unsupported() {
        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), fetcher_serving(b"x"));

        let err = client
            .download_plugin("nonexistent", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DevstrapError::PluginNotFound(_)));

        let err = client
            .download_plugin("apt", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DevstrapError::PlatformUnsupported { plugin, platform } => {
                assert_eq!(plugin, "apt");
                assert_eq!(platform, "linux-amd64");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_download_invalid_name_never_fetches() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockArtifactFetcher::new();
        fetcher.expect_fetch_bytes().times(0);
        let client = client(dir.path(), fetcher);

        for name in ["../../bin/sh", "foo;rm -rf /", "", "CON"] {
            let err = client
                .download_plugin(name, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, DevstrapError::Validation(_)), "{name}");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_cancelled() {
        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), fetcher_serving(b"x"));
        client.get_available_plugins().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.download_plugin("foo", &cancel).await.unwrap_err();
        assert!(matches!(err, DevstrapError::Cancelled));
        assert!(!dir.path().join("foo").exists());
    }

    #[tokio::test]
    async fn test_download_required_skips_present_and_tolerates_failures() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("mise"), b"already here").unwrap();
        let client = client(dir.path(), fetcher_serving(b"artifact"));

        let names: Vec<String> = ["foo", "mise", "apt", "ghost"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = client
            .download_required_plugins(&CancellationToken::new(), &names)
            .await;

        // mise skipped; foo installed; apt unsupported; ghost unknown
        assert_eq!(report.total, 3);
        assert_eq!(report.failed_count(), 2);
        assert!(dir.path().join("foo").exists());
        assert_eq!(
            report.aggregate_error().unwrap().to_string(),
            "failed 2 out of 3 items"
        );
    }

    #[tokio::test]
    async fn test_outdated() {
        use crate::plugins::types::PluginInfo;

        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), fetcher_serving(b"x"));
        let installed = |name: &str, version: &str| {
            InstalledPlugin::new(
                PluginInfo {
                    name: name.to_string(),
                    version: version.to_string(),
                    description: String::new(),
                    author: None,
                    repository: None,
                    tags: vec![],
                    commands: vec![],
                },
                dir.path().join(name),
            )
        };

        let outdated = client
            .outdated(&[
                installed("foo", "0.9.0"),
                installed("apt", "2.0.0"),
                installed("local-only", "1.0.0"),
            ])
            .await
            .unwrap();
        assert_eq!(outdated, vec!["foo"]);
    }
}
