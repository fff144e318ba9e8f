//! Host platform detection and the tables derived from it.
//!
//! - **system**: injectable OS and filesystem providers
//! - **detector**: `Platform` snapshot and `PlatformDetector`
//! - **priority**: installer priority, system package manager and the
//!   required-plugin computation

pub mod detector;
pub mod priority;
pub mod system;

pub use detector::{Platform, PlatformDetector, PACKAGE_MANAGER_CANDIDATES, UNKNOWN};
pub use priority::{installer_priority, required_plugins, system_package_manager};
pub use system::{FsProvider, HostFs, HostOs, OsProvider};
