//! Plugin types for devstrap
//!
//! This module defines the plugin-side identity (`PluginInfo`, declared by a
//! plugin through the describe protocol), the registry-side view
//! (`PluginMetadata`), and the runtime representation of a verified local
//! plugin (`InstalledPlugin`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Tag that marks a plugin as a package manager.
pub const PACKAGE_MANAGER_TAG: &str = "package-manager";

// ============================================================================
// Plugin-declared identity
// ============================================================================

/// A plugin's self-declared identity and command set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Catalog key. Must equal the plugin's file name.
    pub name: String,

    /// Version string as declared by the plugin.
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub commands: Vec<PluginCommand>,
}

/// A command contributed by a plugin. Names are unique within a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCommand {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Usage line shown in help (e.g. `install <package>...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,

    #[serde(default)]
    pub flags: Vec<PluginFlag>,
}

/// A flag a plugin command understands.
///
/// Flags are rendered in help only; arguments reach the plugin unparsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFlag {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shorthand: Option<String>,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl PluginFlag {
    /// Help rendering, e.g. `-y, --yes  Assume yes (default: false)`.
    pub fn help_line(&self) -> String {
        let mut line = match self.shorthand.as_deref() {
            Some(short) if !short.is_empty() => format!("-{}, --{}", short, self.name),
            _ => format!("    --{}", self.name),
        };
        if !self.description.is_empty() {
            line.push_str("  ");
            line.push_str(&self.description);
        }
        if let Some(default) = self.default.as_deref() {
            line.push_str(&format!(" (default: {})", default));
        }
        line
    }
}

/// Plugin category derived from tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    Base,
    PackageManager,
}

impl PluginKind {
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        if tags
            .iter()
            .any(|t| t.as_ref().eq_ignore_ascii_case(PACKAGE_MANAGER_TAG))
        {
            PluginKind::PackageManager
        } else {
            PluginKind::Base
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Base => "base",
            PluginKind::PackageManager => "package-manager",
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Registry-side metadata
// ============================================================================

/// A downloadable artifact for one platform key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub url: String,

    /// `sha256:<hex>` or bare hex digest.
    pub checksum: String,
}

/// A plugin as advertised by the registry manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Filled from the manifest key, which is authoritative.
    #[serde(default)]
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Platform key (`<os>-<arch>`) to artifact.
    #[serde(default)]
    pub platforms: BTreeMap<String, ArtifactInfo>,
}

impl PluginMetadata {
    pub fn artifact_for(&self, platform_key: &str) -> Option<&ArtifactInfo> {
        self.platforms.get(platform_key)
    }

    pub fn kind(&self) -> PluginKind {
        PluginKind::from_tags(&self.tags)
    }

    /// Case-insensitive substring match over name, description and tags.
    /// `needle` must already be lowercase; an empty needle matches everything.
    pub fn matches(&self, needle: &str) -> bool {
        needle.is_empty()
            || self.name.to_lowercase().contains(needle)
            || self.description.to_lowercase().contains(needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(needle))
    }
}

// ============================================================================
// Installed plugin
// ============================================================================

/// A `PluginInfo` bound to a verified local executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPlugin {
    #[serde(flatten)]
    pub info: PluginInfo,

    pub path: PathBuf,
}

impl InstalledPlugin {
    pub fn new(info: PluginInfo, path: PathBuf) -> Self {
        Self { info, path }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn version(&self) -> &str {
        &self.info.version
    }

    pub fn description(&self) -> &str {
        &self.info.description
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commands(&self) -> &[PluginCommand] {
        &self.info.commands
    }

    pub fn tags(&self) -> &[String] {
        &self.info.tags
    }

    pub fn kind(&self) -> PluginKind {
        PluginKind::from_tags(&self.info.tags)
    }

    pub fn command(&self, name: &str) -> Option<&PluginCommand> {
        self.info.commands.iter().find(|c| c.name == name)
    }

    /// `name@version`, as shown by `plugin list`.
    pub fn label(&self) -> String {
        format!("{}@{}", self.info.name, self.info.version)
    }
}

// ============================================================================
// Plugin trait
// ============================================================================

/// Behaviour shared by every plugin the runtime can dispatch to.
///
/// Capabilities beyond `execute` are queried, not inherited: callers ask
/// `kind()` or `supports_command()` rather than downcasting.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn info(&self) -> &PluginInfo;

    fn kind(&self) -> PluginKind {
        PluginKind::from_tags(&self.info().tags)
    }

    fn supports_command(&self, command: &str) -> bool {
        self.info().commands.iter().any(|c| c.name == command)
    }

    /// Run `command` with raw `args`; resolves when the plugin exits.
    async fn execute(
        &self,
        command: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<()>;
}
