//! Identifier validation for every trust boundary.
//!
//! Any value that originates outside the process (plugin names from the
//! registry or the command line, package names, tool specs, directory names,
//! raw plugin arguments) goes through [`validate_name`] before it is
//! interpolated into a path, URL, or subprocess argument.

use aho_corasick::AhoCorasick;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Category of identifier being validated. Each kind has its own length
/// bound and allow-pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationKind {
    /// Plugin name, used as a file name in the plugin directory.
    Plugin,
    /// Plugin-declared command name, used as a CLI subcommand.
    Command,
    /// Package name handed to a package-manager plugin.
    Package,
    /// Tool spec such as `node@18.2.0`.
    ToolSpec,
    /// A single directory name (not a path).
    Directory,
    /// Raw argument forwarded to a plugin process (never through a shell).
    Argument,
}

impl ValidationKind {
    /// Maximum accepted length in bytes.
    pub fn max_len(self) -> usize {
        match self {
            ValidationKind::Plugin | ValidationKind::Command => 64,
            ValidationKind::Package | ValidationKind::ToolSpec => 128,
            ValidationKind::Directory => 255,
            ValidationKind::Argument => 4096,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationKind::Plugin => "plugin name",
            ValidationKind::Command => "command name",
            ValidationKind::Package => "package name",
            ValidationKind::ToolSpec => "tool spec",
            ValidationKind::Directory => "directory name",
            ValidationKind::Argument => "argument",
        }
    }

    fn allows_whitespace_controls(self) -> bool {
        self == ValidationKind::Argument
    }

    fn is_identifier(self) -> bool {
        self != ValidationKind::Argument
    }

    fn pattern(self) -> Option<&'static Regex> {
        match self {
            ValidationKind::Plugin | ValidationKind::Command => Some(&PLUGIN_NAME_RE),
            ValidationKind::Package => Some(&PACKAGE_NAME_RE),
            ValidationKind::ToolSpec => Some(&TOOL_SPEC_RE),
            ValidationKind::Directory => Some(&DIRECTORY_NAME_RE),
            ValidationKind::Argument => None,
        }
    }
}

impl std::fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a value was rejected.
///
/// Messages never echo the raw rejected value except for
/// [`ValidationError::InvalidFormat`], which is only reached after control
/// characters and shell metacharacters have been ruled out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("value is empty")]
    Empty,

    #[error("{kind} is too long ({len} bytes, maximum {max})")]
    TooLong {
        kind: ValidationKind,
        len: usize,
        max: usize,
    },

    #[error("value contains a NUL byte")]
    NulByte,

    #[error("value contains a control character at byte {position}")]
    ControlCharacter { position: usize },

    #[error("value contains a shell metacharacter '{0}'")]
    ShellMetacharacter(char),

    #[error("value contains a path traversal sequence")]
    PathTraversal,

    #[error("value contains a path separator")]
    PathSeparator,

    #[error("'{0}' is a reserved device name")]
    ReservedName(String),

    #[error("invalid {kind} '{value}'")]
    InvalidFormat { kind: ValidationKind, value: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL scheme '{0}' is not allowed (http/https only)")]
    DisallowedScheme(String),

    #[error("URL host '{0}' is local or on a private network")]
    PrivateHost(String),
}

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>'];

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

static PLUGIN_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").expect("valid regex"));

static PACKAGE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._+-]*$").expect("valid regex"));

static TOOL_SPEC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._+-]*(@[a-zA-Z0-9._+-]+)?$").expect("valid regex")
});

static DIRECTORY_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._][a-zA-Z0-9._ -]*$").expect("valid regex"));

// Plain and percent-encoded traversal sequences.
static TRAVERSAL_PATTERNS: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(["..", "%2e%2e", "%252e%252e", "%2e.", ".%2e", "%2f", "%5c"])
        .expect("valid patterns")
});

/// Validate `value` as an identifier of the given kind.
///
/// Checks run in a fixed order and the first failure is returned, so each
/// kind of attack maps to one error category:
///
/// 1. empty input
/// 2. length bound for the kind
/// 3. NUL bytes, then other control characters (tab, LF and CR are allowed
///    only in raw arguments)
/// 4. shell metacharacters (identifiers only)
/// 5. traversal sequences (including a bare `.`), then path separators
///    (identifiers only)
/// 6. reserved device names, case-insensitively and with any extension
/// 7. the kind's allow-pattern
///
/// # Examples
///
/// ```
/// use devstrap::security::{validate_name, ValidationError, ValidationKind};
///
/// assert!(validate_name(ValidationKind::Plugin, "node-18").is_ok());
/// assert_eq!(
///     validate_name(ValidationKind::Plugin, "../evil"),
///     Err(ValidationError::PathTraversal)
/// );
/// ```
pub fn validate_name(kind: ValidationKind, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty);
    }

    let max = kind.max_len();
    if value.len() > max {
        return Err(ValidationError::TooLong {
            kind,
            len: value.len(),
            max,
        });
    }

    if value.contains('\0') {
        return Err(ValidationError::NulByte);
    }

    if let Some((position, _)) = value.char_indices().find(|(_, c)| {
        c.is_control() && !(kind.allows_whitespace_controls() && matches!(c, '\t' | '\n' | '\r'))
    }) {
        return Err(ValidationError::ControlCharacter { position });
    }

    if !kind.is_identifier() {
        return Ok(());
    }

    if let Some(c) = value.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(ValidationError::ShellMetacharacter(c));
    }

    if value == "." || TRAVERSAL_PATTERNS.is_match(value) {
        return Err(ValidationError::PathTraversal);
    }

    if value.contains('/') || value.contains('\\') {
        return Err(ValidationError::PathSeparator);
    }

    if is_reserved_device_name(value) {
        return Err(ValidationError::ReservedName(value.to_string()));
    }

    if let Some(re) = kind.pattern() {
        if !re.is_match(value) {
            return Err(ValidationError::InvalidFormat {
                kind,
                value: value.to_string(),
            });
        }
    }

    Ok(())
}

/// Shorthand for [`validate_name`] with [`ValidationKind::Plugin`].
pub fn validate_plugin_name(name: &str) -> Result<(), ValidationError> {
    validate_name(ValidationKind::Plugin, name)
}

/// Validate every raw argument destined for a plugin process.
pub fn validate_arguments<S: AsRef<str>>(args: &[S]) -> Result<(), ValidationError> {
    args.iter()
        .try_for_each(|arg| validate_name(ValidationKind::Argument, arg.as_ref()))
}

fn is_reserved_device_name(value: &str) -> bool {
    let stem = value.split('.').next().unwrap_or(value).trim_end();
    RESERVED_DEVICE_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
}
