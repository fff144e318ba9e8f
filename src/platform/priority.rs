//! Static preference tables derived from a [`Platform`].
//!
//! Everything here is a pure function of the platform snapshot: the same
//! input always yields the same ordered output.

use super::detector::Platform;

/// Installer preference per (os, distribution family), most preferred first.
const INSTALLER_PRIORITY: &[(&str, &[&str], &[&str])] = &[
    (
        "linux",
        &["ubuntu", "debian", "pop", "linuxmint", "elementary", "zorin", "kali"],
        &["apt", "flatpak", "snap", "mise", "pip"],
    ),
    (
        "linux",
        &["arch", "manjaro", "endeavouros", "garuda", "cachyos"],
        &["yay", "paru", "pacman", "flatpak", "mise", "pip"],
    ),
    (
        "linux",
        &["fedora", "rhel", "centos", "rocky", "almalinux"],
        &["dnf", "yum", "flatpak", "mise", "pip"],
    ),
    (
        "linux",
        &["opensuse", "opensuse-tumbleweed", "opensuse-leap", "sles"],
        &["zypper", "flatpak", "mise", "pip"],
    ),
    ("linux", &["alpine"], &["apk", "mise", "pip"]),
    ("linux", &["gentoo"], &["emerge", "mise", "pip"]),
    ("linux", &["nixos"], &["nix"]),
    ("darwin", &["darwin"], &["brew", "port", "mise", "pip"]),
    ("windows", &["windows"], &["winget", "scoop", "choco"]),
];

const LINUX_FALLBACK_PRIORITY: &[&str] = &["flatpak", "nix", "mise", "pip"];

/// System package manager per (os, distribution family).
const SYSTEM_PACKAGE_MANAGER: &[(&str, &[&str], &str)] = &[
    (
        "linux",
        &["ubuntu", "debian", "pop", "linuxmint", "elementary", "zorin", "kali"],
        "apt",
    ),
    (
        "linux",
        &["arch", "manjaro", "endeavouros", "garuda", "cachyos"],
        "pacman",
    ),
    (
        "linux",
        &["fedora", "rhel", "centos", "rocky", "almalinux"],
        "dnf",
    ),
    (
        "linux",
        &["opensuse", "opensuse-tumbleweed", "opensuse-leap", "sles"],
        "zypper",
    ),
    ("linux", &["alpine"], "apk"),
    ("linux", &["nixos"], "nix"),
    ("darwin", &["darwin"], "brew"),
    ("windows", &["windows"], "winget"),
];

/// Desktops that have a dedicated configuration plugin.
const DESKTOP_PLUGINS: &[&str] = &[
    "gnome", "kde", "xfce", "cinnamon", "mate", "budgie", "hyprland", "sway", "i3", "cosmic",
];

/// Tool-manager plugins every platform gets.
const UNIVERSAL_PLUGINS: &[&str] = &["mise", "pip"];

fn lookup<T: Copy>(table: &[(&str, &[&str], T)], platform: &Platform) -> Option<T> {
    table
        .iter()
        .find(|(os, distros, _)| {
            *os == platform.os && distros.contains(&platform.distribution.as_str())
        })
        .map(|(_, _, value)| *value)
}

/// Ordered installer preferences for this platform.
///
/// When any package managers were detected, the table entry is filtered down
/// to the ones actually present; otherwise the full table entry is returned
/// so callers can still suggest what to install.
pub fn installer_priority(platform: &Platform) -> Vec<&'static str> {
    let table: &'static [&'static str] = lookup(INSTALLER_PRIORITY, platform).unwrap_or(
        if platform.is_linux() {
            LINUX_FALLBACK_PRIORITY
        } else {
            &[]
        },
    );

    if platform.package_managers.is_empty() {
        return table.to_vec();
    }

    table
        .iter()
        .copied()
        .filter(|pm| platform.has_package_manager(pm))
        .collect()
}

/// The distribution's native package manager, if the platform is known.
pub fn system_package_manager(platform: &Platform) -> Option<&'static str> {
    lookup(SYSTEM_PACKAGE_MANAGER, platform)
}

/// Plugins the bootstrap must make sure are installed on this platform.
///
/// Order: system package manager, AUR helper on Arch-family systems, desktop
/// plugin, then the universal tool managers. Duplicates keep their first
/// position.
pub fn required_plugins(platform: &Platform) -> Vec<String> {
    let mut required: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !required.iter().any(|r| r == name) {
            required.push(name.to_string());
        }
    };

    if let Some(pm) = system_package_manager(platform) {
        push(pm);
        if pm == "pacman" {
            push("yay");
        }
    }

    if platform.is_linux() && DESKTOP_PLUGINS.contains(&platform.desktop_env.as_str()) {
        push(&platform.desktop_env);
    }

    for name in UNIVERSAL_PLUGINS.iter().copied() {
        push(name);
    }

    required
}
