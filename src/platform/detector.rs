//! Platform detection.
//!
//! Every field of a [`Platform`] is either a raw OS API value normalised into
//! the registry vocabulary or a value drawn from a fixed allow-list. Nothing
//! read from the environment or from release files is forwarded verbatim.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::system::{FsProvider, HostFs, HostOs, OsProvider};

/// Placeholder for any field that could not be determined safely.
pub const UNKNOWN: &str = "unknown";

const OS_RELEASE_PATHS: &[&str] = &["/etc/os-release", "/usr/lib/os-release"];

/// Distribution marker files, probed in priority order when os-release has
/// no usable `ID=`.
const DISTRIBUTION_MARKERS: &[(&str, &str)] = &[
    ("/etc/arch-release", "arch"),
    ("/etc/fedora-release", "fedora"),
    ("/etc/redhat-release", "rhel"),
    ("/etc/debian_version", "debian"),
    ("/etc/alpine-release", "alpine"),
    ("/etc/gentoo-release", "gentoo"),
    ("/etc/SuSE-release", "opensuse"),
    ("/etc/NIXOS", "nixos"),
];

/// Environment variables that may name the running desktop, in lookup order.
const DESKTOP_ENV_VARS: &[&str] = &["XDG_CURRENT_DESKTOP", "XDG_SESSION_DESKTOP", "DESKTOP_SESSION"];

/// Recognised desktop tokens and the canonical name they map to.
const DESKTOP_ALLOW_LIST: &[(&str, &str)] = &[
    ("gnome", "gnome"),
    ("unity", "gnome"),
    ("kde", "kde"),
    ("plasma", "kde"),
    ("xfce", "xfce"),
    ("cinnamon", "cinnamon"),
    ("mate", "mate"),
    ("budgie", "budgie"),
    ("lxqt", "lxqt"),
    ("lxde", "lxde"),
    ("pantheon", "pantheon"),
    ("deepin", "deepin"),
    ("cosmic", "cosmic"),
    ("hyprland", "hyprland"),
    ("sway", "sway"),
    ("i3", "i3"),
];

/// Package-manager binaries looked for on `PATH`, in reporting order.
pub const PACKAGE_MANAGER_CANDIDATES: &[&str] = &[
    "apt", "dnf", "yum", "pacman", "yay", "paru", "zypper", "apk", "emerge", "nix", "brew", "port",
    "flatpak", "snap", "mise", "pip", "winget", "scoop", "choco",
];

static OS_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]{1,16}$").expect("valid regex"));

static RELEASE_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,31}$").expect("valid regex"));

/// Immutable snapshot of the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Registry OS name (`linux`, `darwin`, `windows`, ...).
    pub os: String,
    /// Distribution id on Linux, otherwise the OS name.
    pub distribution: String,
    /// Distribution or OS release version, `unknown` when undeterminable.
    pub version: String,
    /// Canonical desktop name on Linux, otherwise the OS name.
    pub desktop_env: String,
    /// Registry architecture name (`amd64`, `arm64`, ...).
    pub architecture: String,
    /// Detected package managers, in [`PACKAGE_MANAGER_CANDIDATES`] order.
    pub package_managers: Vec<String>,
}

impl Platform {
    /// The registry platform key, `<os>-<architecture>`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.os, self.architecture)
    }

    pub fn is_linux(&self) -> bool {
        self.os == "linux"
    }

    pub fn has_package_manager(&self, name: &str) -> bool {
        self.package_managers.iter().any(|pm| pm == name)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() || self.version == UNKNOWN {
            write!(f, "{} ({} {})", self.distribution, self.os, self.architecture)
        } else {
            write!(
                f,
                "{} {} ({} {})",
                self.distribution, self.version, self.os, self.architecture
            )
        }
    }
}

/// Detects the host [`Platform`] from injected providers.
#[derive(Clone)]
pub struct PlatformDetector {
    os: Arc<dyn OsProvider>,
    fs: Arc<dyn FsProvider>,
}

impl PlatformDetector {
    /// Create a detector with explicit providers.
    pub fn new(os: Arc<dyn OsProvider>, fs: Arc<dyn FsProvider>) -> Self {
        Self { os, fs }
    }

    /// Create a detector backed by the real host.
    pub fn host() -> Self {
        Self::new(Arc::new(HostOs), Arc::new(HostFs))
    }

    /// Detect the current platform.
    pub fn detect(&self) -> Platform {
        let os = normalize_os(&self.os.os());
        let architecture = normalize_arch(&self.os.arch());

        let (distribution, version) = if os == "linux" {
            self.detect_linux_release()
        } else {
            let version = self
                .os
                .os_version()
                .and_then(|v| sanitize_release_value(&v))
                .unwrap_or_else(|| UNKNOWN.to_string());
            (os.clone(), version)
        };

        let desktop_env = if os == "linux" {
            self.detect_desktop()
        } else {
            os.clone()
        };

        let package_managers = self.detect_package_managers();

        let platform = Platform {
            os,
            distribution,
            version,
            desktop_env,
            architecture,
            package_managers,
        };

        info!(
            platform = %platform,
            desktop = %platform.desktop_env,
            package_managers = ?platform.package_managers,
            "Detected platform"
        );

        platform
    }

    fn detect_linux_release(&self) -> (String, String) {
        let release = OS_RELEASE_PATHS
            .iter()
            .find_map(|p| self.fs.read_to_string(Path::new(p)));

        let mut id = None;
        let mut version = None;
        if let Some(content) = release.as_deref() {
            id = os_release_field(content, "ID").and_then(|v| sanitize_release_value(&v));
            version =
                os_release_field(content, "VERSION_ID").and_then(|v| sanitize_release_value(&v));
        }

        let distribution = match id {
            Some(id) => id,
            None => self.probe_distribution_markers(),
        };

        let version = version
            .or_else(|| {
                if distribution == "debian" {
                    self.fs
                        .read_to_string(Path::new("/etc/debian_version"))
                        .and_then(|v| sanitize_release_value(&v))
                } else {
                    None
                }
            })
            .unwrap_or_else(|| UNKNOWN.to_string());

        (distribution, version)
    }

    fn probe_distribution_markers(&self) -> String {
        for (path, name) in DISTRIBUTION_MARKERS {
            if self.fs.exists(Path::new(path)) {
                debug!(marker = path, distribution = name, "Distribution marker found");
                return name.to_string();
            }
        }
        UNKNOWN.to_string()
    }

    fn detect_desktop(&self) -> String {
        for var in DESKTOP_ENV_VARS {
            let Some(raw) = self.os.env_var(var) else {
                continue;
            };
            if let Some(desktop) = match_desktop(&raw) {
                return desktop.to_string();
            }
            debug!(variable = var, "Desktop variable set but not recognised");
        }
        UNKNOWN.to_string()
    }

    fn detect_package_managers(&self) -> Vec<String> {
        PACKAGE_MANAGER_CANDIDATES
            .iter()
            .filter(|name| self.os.has_binary(name))
            .map(|name| name.to_string())
            .collect()
    }
}

impl Default for PlatformDetector {
    fn default() -> Self {
        Self::host()
    }
}

/// Map a raw runtime OS name onto the registry vocabulary.
pub fn normalize_os(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    let mapped = match lower.as_str() {
        "macos" | "darwin" | "osx" => "darwin",
        other => other,
    };
    if OS_TOKEN_RE.is_match(mapped) {
        mapped.to_string()
    } else {
        UNKNOWN.to_string()
    }
}

/// Map a raw runtime architecture onto the registry vocabulary.
pub fn normalize_arch(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    let mapped = match lower.as_str() {
        "x86_64" | "amd64" | "x64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "x86" | "i386" | "i686" | "386" => "386",
        other => other,
    };
    if OS_TOKEN_RE.is_match(mapped) {
        mapped.to_string()
    } else {
        UNKNOWN.to_string()
    }
}

fn os_release_field(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        if k.trim() != key {
            return None;
        }
        let v = v.trim().trim_matches('"').trim_matches('\'');
        Some(v.to_string())
    })
}

fn sanitize_release_value(raw: &str) -> Option<String> {
    let value = raw.trim().to_ascii_lowercase();
    RELEASE_VALUE_RE.is_match(&value).then_some(value)
}

fn match_desktop(raw: &str) -> Option<&'static str> {
    raw.split(':').find_map(|token| {
        let token = token.trim().to_ascii_lowercase();
        DESKTOP_ALLOW_LIST
            .iter()
            .find(|(candidate, _)| *candidate == token)
            .map(|(_, canonical)| *canonical)
    })
}
