//! The describe protocol.
//!
//! Invoked with the single reserved argument [`DESCRIBE_ARG`], a plugin
//! prints exactly one JSON document to stdout:
//!
//! ```json
//! {
//!   "protocol_version": 1,
//!   "name": "apt",
//!   "version": "1.2.0",
//!   "description": "Debian package manager",
//!   "tags": ["package-manager"],
//!   "commands": [
//!     {
//!       "name": "install",
//!       "description": "Install packages",
//!       "usage": "install <package>...",
//!       "flags": [{"name": "yes", "shorthand": "y", "description": "Assume yes"}]
//!     }
//!   ]
//! }
//! ```

use std::collections::HashSet;

use serde::Deserialize;

use crate::security::{validate_name, validate_plugin_name, ValidationKind};

use super::types::PluginInfo;

/// Reserved argument that asks a plugin to describe itself.
pub const DESCRIBE_ARG: &str = "__devstrap_describe";

/// The only protocol version this runtime speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on describe output.
pub const MAX_DESCRIBE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct DescribeDocument {
    #[serde(default = "default_protocol_version")]
    protocol_version: u32,

    #[serde(flatten)]
    info: PluginInfo,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Parse and validate describe output from the plugin installed as
/// `file_name`. Returns the rejection reason on failure.
pub fn parse_describe(output: &[u8], file_name: &str) -> Result<PluginInfo, String> {
    if output.len() > MAX_DESCRIBE_BYTES {
        return Err(format!(
            "describe output exceeds {} bytes",
            MAX_DESCRIBE_BYTES
        ));
    }

    let doc: DescribeDocument = serde_json::from_slice(output)
        .map_err(|e| format!("malformed describe output: {}", e))?;

    if doc.protocol_version != PROTOCOL_VERSION {
        return Err(format!(
            "unsupported protocol version {} (expected {})",
            doc.protocol_version, PROTOCOL_VERSION
        ));
    }

    let info = doc.info;
    validate_plugin_name(&info.name).map_err(|e| format!("invalid declared name: {}", e))?;
    if info.name != file_name {
        return Err(format!(
            "declared name '{}' does not match file name '{}'",
            info.name, file_name
        ));
    }

    if info.version.trim().is_empty() {
        return Err("empty version".to_string());
    }
    if info.version.chars().any(char::is_control) {
        return Err("version contains control characters".to_string());
    }

    let mut seen = HashSet::new();
    for command in &info.commands {
        validate_name(ValidationKind::Command, &command.name)
            .map_err(|e| format!("invalid command name '{}': {}", command.name, e))?;
        if !seen.insert(command.name.as_str()) {
            return Err(format!("duplicate command '{}'", command.name));
        }
        for flag in &command.flags {
            validate_name(ValidationKind::Command, &flag.name).map_err(|e| {
                format!(
                    "invalid flag '{}' on command '{}': {}",
                    flag.name, command.name, e
                )
            })?;
            if let Some(short) = flag.shorthand.as_deref() {
                let mut chars = short.chars();
                let valid = matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_alphanumeric());
                if !valid {
                    return Err(format!(
                        "invalid shorthand '{}' for flag '{}'",
                        short, flag.name
                    ));
                }
            }
        }
    }

    Ok(info)
}
