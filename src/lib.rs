//! devstrap - developer machine bootstrapper driven by plugin executables
//!
//! On startup devstrap detects the host platform, works out which plugins
//! that platform needs, installs the missing ones from a registry with
//! checksum verification, and exposes every installed plugin's commands as
//! CLI subcommands.

pub mod batch;
pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod error;
pub mod platform;
pub mod plugins;
pub mod security;

pub use bootstrap::{Bootstrap, BootstrapSummary};
pub use config::Config;
pub use error::{DevstrapError, Result};
