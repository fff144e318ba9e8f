//! Plugin system for devstrap
//!
//! A plugin is a standalone executable in the plugin directory. The runtime
//! learns what it offers by running it with the reserved describe argument,
//! then exposes its commands as CLI subcommands that spawn it with the raw
//! arguments.
//!
//! # Architecture
//!
//! - **types**: Core data structures (`PluginInfo`, `PluginMetadata`, `InstalledPlugin`, `Plugin`)
//! - **protocol**: The describe document and its validation
//! - **loader**: Directory scan and describe probes
//! - **catalog**: `PluginManager`, the name→plugin map, execution and uninstall
//! - **fetch**: `ArtifactFetcher` and its HTTP implementation
//! - **lock**: Per-name install locks
//! - **registry**: `RegistryClient`, manifest search and verified installs
//! - **compose**: Attaching plugin commands to the clap tree
//!
//! # Plugin Directory Structure
//!
//! ```text
//! ~/.devstrap/plugins/
//! ├── apt
//! ├── gnome
//! ├── mise
//! └── pip
//! ```

pub mod catalog;
pub mod compose;
pub mod fetch;
pub mod loader;
pub mod lock;
pub mod protocol;
pub mod registry;
pub mod types;

pub use catalog::{ExecutablePlugin, PluginManager};
pub use compose::{register_commands, resolve_invocation, PluginInvocation, RESERVED_COMMANDS};
pub use fetch::{ArtifactFetcher, HttpFetcher};
pub use loader::{discover_plugins, probe_plugin, DEFAULT_PROBE_TIMEOUT};
pub use lock::InstallLock;
pub use protocol::DESCRIBE_ARG;
pub use registry::{RegistryClient, RegistryOptions, DEFAULT_REGISTRY_URL};
pub use types::{
    ArtifactInfo, InstalledPlugin, Plugin, PluginCommand, PluginFlag, PluginInfo, PluginKind,
    PluginMetadata,
};
