//! Trust-boundary validation.
//!
//! - **names**: identifier validation (plugin, command, package, tool spec,
//!   directory, raw argument)
//! - **url**: registry and artifact URL validation
//! - **path**: the only constructor of plugin file paths

pub mod names;
pub mod path;
pub mod url;

pub use names::{
    validate_arguments, validate_name, validate_plugin_name, ValidationError, ValidationKind,
};
pub use path::{plugin_lock_path, plugin_path, SafePath};
pub use url::validate_registry_url;
