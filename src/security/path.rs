//! Path construction for plugin binaries.
//!
//! Plugin files live directly inside the plugin directory. This module is the
//! only place that turns a plugin name into a filesystem path, so every path
//! handed to the installer, the catalog, or the executor is known to be a
//! direct child of the plugin directory.

use std::path::{Component, Path, PathBuf};

use super::names::{validate_plugin_name, ValidationError};

/// A validated path that is guaranteed to be a direct child of the plugin
/// directory.
///
/// This struct can only be created through [`plugin_path`] or
/// [`plugin_lock_path`], ensuring that any `SafePath` instance names a file
/// that cannot escape the directory it was resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePath {
    path: PathBuf,
}

impl SafePath {
    /// Returns a reference to the underlying path.
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Converts the SafePath into a PathBuf.
    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for SafePath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Resolve `<plugin_dir>/<name>` after validating `name`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use devstrap::security::plugin_path;
///
/// let path = plugin_path(Path::new("/opt/plugins"), "apt").unwrap();
/// assert_eq!(path.as_path(), Path::new("/opt/plugins/apt"));
///
/// assert!(plugin_path(Path::new("/opt/plugins"), "../../bin/sh").is_err());
/// ```
pub fn plugin_path(plugin_dir: &Path, name: &str) -> Result<SafePath, ValidationError> {
    validate_plugin_name(name)?;
    child_of(plugin_dir, name)
}

/// Resolve the install lock file `<plugin_dir>/.<name>.lock`.
pub fn plugin_lock_path(plugin_dir: &Path, name: &str) -> Result<SafePath, ValidationError> {
    validate_plugin_name(name)?;
    child_of(plugin_dir, &format!(".{}.lock", name))
}

fn child_of(dir: &Path, file_name: &str) -> Result<SafePath, ValidationError> {
    let joined = dir.join(file_name);

    // A validated name is a single normal component; anything else means the
    // validator and this function disagree, which must never reach the disk.
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(ValidationError::PathTraversal),
    }

    if joined.parent() != Some(dir) {
        return Err(ValidationError::PathTraversal);
    }

    Ok(SafePath { path: joined })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_path_is_direct_child() {
        let dir = Path::new("/home/dev/.devstrap/plugins");
        let path = plugin_path(dir, "gnome").unwrap();
        assert_eq!(path.as_path().parent(), Some(dir));
        assert!(path.as_path().ends_with("gnome"));
    }

    #[test]
    fn test_plugin_path_rejects_traversal() {
        let dir = Path::new("/tmp/plugins");
        assert_eq!(
            plugin_path(dir, "../evil"),
            Err(ValidationError::PathTraversal)
        );
        assert!(plugin_path(dir, "/etc/passwd").is_err());
        assert!(plugin_path(dir, "..").is_err());
    }

    #[test]
    fn test_lock_path() {
        let dir = Path::new("/tmp/plugins");
        let lock = plugin_lock_path(dir, "apt").unwrap();
        assert_eq!(lock.as_path(), Path::new("/tmp/plugins/.apt.lock"));
        assert!(plugin_lock_path(dir, "a;b").is_err());
    }

    #[test]
    fn test_safe_path_conversion() {
        let safe_path = plugin_path(Path::new("/tmp/plugins"), "mise").unwrap();

        assert!(safe_path.as_path().ends_with("mise"));

        let path_buf = safe_path.clone().into_path_buf();
        assert!(path_buf.ends_with("mise"));

        let path_ref: &Path = safe_path.as_ref();
        assert!(path_ref.ends_with("mise"));
    }
}
