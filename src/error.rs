//! Error types for devstrap
//!
//! This module defines all error types used throughout the bootstrap runtime.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.
//!
//! The variants follow the failure taxonomy of the runtime:
//!
//! - **Setup** errors abort bootstrap construction.
//! - **Network** and **Discovery** errors degrade the bootstrap (the plugin in
//!   question is skipped) but never abort it.
//! - **Validation** errors reject a single operation before any side effect.
//! - **Execution** / **PluginExit** errors surface as the invoking command's
//!   failure.

use thiserror::Error;

use crate::security::ValidationError;

/// The primary error type for devstrap operations.
#[derive(Error, Debug)]
pub enum DevstrapError {
    /// Home directory inaccessible, plugin directory uncreatable, etc.
    #[error("Setup error: {0}")]
    Setup(String),

    /// Configuration-related errors (unreadable settings file, bad values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry unreachable, download failed, malformed manifest
    #[error("Network error: {0}")]
    Network(String),

    /// An externally-influenced value failed validation. Not a `#[source]`:
    /// the message already carries the detail.
    #[error("Validation error: {0}")]
    Validation(ValidationError),

    /// A plugin binary failed to describe itself
    #[error("Discovery error for '{plugin}': {reason}")]
    Discovery { plugin: String, reason: String },

    /// A plugin process could not be spawned or was killed
    #[error("Execution error: {0}")]
    Execution(String),

    /// A plugin process ran to completion with a non-zero exit code
    #[error("Plugin '{plugin}' exited with code {code}")]
    PluginExit { plugin: String, code: i32 },

    /// Plugin is neither installed nor advertised by the registry
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// The registry has no artifact for the current platform key
    #[error("Plugin '{plugin}' is not available for platform '{platform}'")]
    PlatformUnsupported { plugin: String, platform: String },

    /// Downloaded artifact does not match the registry-declared digest
    #[error("Checksum mismatch for '{plugin}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        plugin: String,
        expected: String,
        actual: String,
    },

    /// Another install of the same plugin holds the lock
    #[error("Busy: {0}")]
    Busy(String),

    /// A network call, probe or batch item ran past its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The surrounding operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// At least one item of a batch failed
    #[error("failed {failed} out of {total} items")]
    Batch { failed: usize, total: usize },

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DevstrapError {
    /// Whether this error must abort the bootstrap rather than degrade it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DevstrapError::Setup(_) | DevstrapError::Cancelled)
    }

    /// Process exit code the CLI should use for this error.
    ///
    /// Plugin-routed failures pass the plugin's own code through; everything
    /// else is the generic failure code `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            DevstrapError::PluginExit { code, .. } => *code,
            _ => 1,
        }
    }
}

impl From<ValidationError> for DevstrapError {
    fn from(err: ValidationError) -> Self {
        DevstrapError::Validation(err)
    }
}

/// A specialized `Result` type for devstrap operations.
pub type Result<T> = std::result::Result<T, DevstrapError>;
