//! Host access behind injectable providers.
//!
//! The detector never touches the OS directly; it asks an [`OsProvider`] and
//! an [`FsProvider`]. The host implementations live here, and tests swap in
//! in-memory fakes.

use std::path::Path;

use tracing::debug;

/// Runtime facts about the operating system.
pub trait OsProvider: Send + Sync {
    /// Raw OS name as reported by the runtime (e.g. `linux`, `macos`).
    fn os(&self) -> String;

    /// Raw CPU architecture as reported by the runtime (e.g. `x86_64`).
    fn arch(&self) -> String;

    /// OS release version on platforms without `/etc/os-release`.
    fn os_version(&self) -> Option<String>;

    /// Read an environment variable.
    fn env_var(&self, key: &str) -> Option<String>;

    /// Whether an executable with this exact name is on `PATH`.
    fn has_binary(&self, name: &str) -> bool;
}

/// Read-only filesystem access used during detection.
pub trait FsProvider: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Option<String>;

    fn exists(&self, path: &Path) -> bool;
}

/// The real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostOs;

impl OsProvider for HostOs {
    fn os(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn arch(&self) -> String {
        std::env::consts::ARCH.to_string()
    }

    fn os_version(&self) -> Option<String> {
        if cfg!(target_os = "macos") {
            let output = std::process::Command::new("sw_vers")
                .arg("-productVersion")
                .output()
                .ok()?;
            if !output.status.success() {
                return None;
            }
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!version.is_empty()).then_some(version)
        } else {
            None
        }
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn has_binary(&self, name: &str) -> bool {
        let found = which::which(name).is_ok();
        debug!(binary = name, found, "Checked binary presence");
        found
    }
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFs;

impl FsProvider for HostFs {
    fn read_to_string(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory providers for detector and bootstrap tests.

    use std::collections::{HashMap, HashSet};
    use std::path::{Path, PathBuf};

    use super::{FsProvider, OsProvider};

    #[derive(Debug, Clone, Default)]
    pub struct FakeOs {
        pub os: String,
        pub arch: String,
        pub version: Option<String>,
        pub env: HashMap<String, String>,
        pub binaries: HashSet<String>,
    }

    impl FakeOs {
        pub fn new(os: &str, arch: &str) -> Self {
            Self {
                os: os.to_string(),
                arch: arch.to_string(),
                ..Default::default()
            }
        }

        pub fn with_env(mut self, key: &str, value: &str) -> Self {
            self.env.insert(key.to_string(), value.to_string());
            self
        }

        pub fn with_binaries(mut self, names: &[&str]) -> Self {
            self.binaries.extend(names.iter().map(|n| n.to_string()));
            self
        }

        pub fn with_version(mut self, version: &str) -> Self {
            self.version = Some(version.to_string());
            self
        }
    }

    impl OsProvider for FakeOs {
        fn os(&self) -> String {
            self.os.clone()
        }

        fn arch(&self) -> String {
            self.arch.clone()
        }

        fn os_version(&self) -> Option<String> {
            self.version.clone()
        }

        fn env_var(&self, key: &str) -> Option<String> {
            self.env.get(key).cloned()
        }

        fn has_binary(&self, name: &str) -> bool {
            self.binaries.contains(name)
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeFs {
        pub files: HashMap<PathBuf, String>,
    }

    impl FakeFs {
        pub fn with_file(mut self, path: &str, content: &str) -> Self {
            self.files.insert(PathBuf::from(path), content.to_string());
            self
        }
    }

    impl FsProvider for FakeFs {
        fn read_to_string(&self, path: &Path) -> Option<String> {
            self.files.get(path).cloned()
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }
    }

    /// An Ubuntu 22.04 GNOME desktop on amd64 with apt and pip.
    pub fn ubuntu_gnome() -> (FakeOs, FakeFs) {
        let os = FakeOs::new("linux", "x86_64")
            .with_env("XDG_CURRENT_DESKTOP", "ubuntu:GNOME")
            .with_binaries(&["apt", "pip", "flatpak"]);
        let fs = FakeFs::default().with_file(
            "/etc/os-release",
            "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n",
        );
        (os, fs)
    }
}
