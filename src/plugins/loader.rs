//! Plugin discovery and loading for devstrap
//!
//! Discovery scans the plugin directory for executable files whose names pass
//! the plugin-name validator and probes each one with the describe argument.
//! Plugins that fail to describe themselves are logged as warnings but do not
//! cause the overall discovery to fail.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DevstrapError, Result};
use crate::security::validate_plugin_name;

use super::protocol::{parse_describe, DESCRIBE_ARG, MAX_DESCRIBE_BYTES};
use super::types::{InstalledPlugin, PluginInfo};

/// Probes running at the same time during discovery.
pub const PROBE_CONCURRENCY: usize = 4;

/// Default describe-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Discover every valid plugin in `dir`.
///
/// A missing directory yields an empty map. The map is keyed by plugin name,
/// which always equals the file name.
pub async fn discover_plugins(
    dir: &Path,
    probe_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<HashMap<String, InstalledPlugin>> {
    let candidates = scan_candidates(dir)?;
    debug!(dir = %dir.display(), candidates = candidates.len(), "Scanned plugin directory");

    let probes = stream::iter(candidates.into_iter().map(|(name, path)| {
        let cancel = cancel.clone();
        async move {
            let outcome = probe_plugin(&path, &name, probe_timeout, &cancel).await;
            (name, path, outcome)
        }
    }))
    .buffer_unordered(PROBE_CONCURRENCY)
    .collect::<Vec<_>>()
    .await;

    if cancel.is_cancelled() {
        return Err(DevstrapError::Cancelled);
    }

    let mut plugins = HashMap::new();
    for (name, path, outcome) in probes {
        match outcome {
            Ok(info) => {
                info!(
                    plugin = %info.name,
                    version = %info.version,
                    commands = info.commands.len(),
                    "Discovered plugin"
                );
                plugins.insert(name, InstalledPlugin::new(info, path));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load plugin, skipping");
            }
        }
    }

    Ok(plugins)
}

/// List `(name, path)` for every regular executable file in `dir` whose file
/// name is a valid plugin name. Lock and temp files never qualify.
pub fn scan_candidates(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.exists() {
        info!(dir = %dir.display(), "Plugin directory does not exist, skipping");
        return Ok(Vec::new());
    }
    if !dir.is_dir() {
        warn!(path = %dir.display(), "Plugin path is not a directory, skipping");
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|e| {
        DevstrapError::Discovery {
            plugin: dir.display().to_string(),
            reason: format!("failed to read plugin directory: {}", e),
        }
    })?;

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Failed to read directory entry, skipping");
                continue;
            }
        };

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if validate_plugin_name(&name).is_err() {
            debug!(file = %name, "Ignoring file with invalid plugin name");
            continue;
        }

        let path = entry.path();
        // symlink_metadata: a symlink is not a regular file
        let Ok(metadata) = fs::symlink_metadata(&path) else {
            continue;
        };
        if !metadata.is_file() || !is_executable(&metadata) {
            debug!(file = %name, "Ignoring non-executable entry");
            continue;
        }

        candidates.push((name, path));
    }

    candidates.sort();
    Ok(candidates)
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    true
}

/// Run `<path> __devstrap_describe` and validate its output.
pub async fn probe_plugin(
    path: &Path,
    file_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PluginInfo> {
    let discovery_err = |reason: String| DevstrapError::Discovery {
        plugin: file_name.to_string(),
        reason,
    };

    let mut cmd = Command::new(path);
    cmd.arg(DESCRIBE_ARG)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = spawn(&mut cmd)
        .await
        .map_err(|e| discovery_err(format!("failed to spawn: {}", e)))?;

    enum Probe {
        Finished(std::result::Result<Vec<u8>, String>),
        TimedOut,
        Cancelled,
    }

    let probe = tokio::select! {
        biased;
        _ = cancel.cancelled() => Probe::Cancelled,
        res = tokio::time::timeout(timeout, read_describe_output(&mut child)) => match res {
            Ok(finished) => Probe::Finished(finished),
            Err(_) => Probe::TimedOut,
        },
    };

    let output = match probe {
        Probe::Finished(Ok(output)) => output,
        Probe::Finished(Err(reason)) => {
            let _ = child.kill().await;
            return Err(discovery_err(reason));
        }
        Probe::TimedOut => {
            let _ = child.kill().await;
            return Err(discovery_err(format!(
                "describe timed out after {} ms",
                timeout.as_millis()
            )));
        }
        Probe::Cancelled => {
            let _ = child.kill().await;
            return Err(DevstrapError::Cancelled);
        }
    };

    parse_describe(&output, file_name).map_err(discovery_err)
}

async fn read_describe_output(child: &mut Child) -> std::result::Result<Vec<u8>, String> {
    let Some(stdout) = child.stdout.take() else {
        return Err("stdout not captured".to_string());
    };

    let mut output = Vec::new();
    stdout
        .take(MAX_DESCRIBE_BYTES as u64 + 1)
        .read_to_end(&mut output)
        .await
        .map_err(|e| format!("failed to read describe output: {}", e))?;
    if output.len() > MAX_DESCRIBE_BYTES {
        return Err(format!(
            "describe output exceeds {} bytes",
            MAX_DESCRIBE_BYTES
        ));
    }

    let status = child
        .wait()
        .await
        .map_err(|e| format!("failed to wait for describe: {}", e))?;
    if !status.success() {
        return Err(match status.code() {
            Some(code) => format!("describe exited with code {}", code),
            None => "describe terminated by signal".to_string(),
        });
    }

    Ok(output)
}

/// Spawn `cmd`, retrying briefly while the executable is still open for
/// writing elsewhere (ETXTBSY right after an install).
pub(crate) async fn spawn(cmd: &mut Command) -> std::io::Result<Child> {
    const ETXTBSY: i32 = 26;
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Err(e) if cfg!(unix) && e.raw_os_error() == Some(ETXTBSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20 * attempts)).await;
            }
            other => return other,
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    //! Shell-script plugins for tests.

    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// A shell script that prints `describe` for the describe argument and
    /// runs `body` otherwise.
    pub fn script_plugin(describe: &str, body: &str) -> String {
        format!(
            "#!/bin/sh\nif [ \"$1\" = \"__devstrap_describe\" ]; then\ncat <<'DEVSTRAP_EOF'\n{}\nDEVSTRAP_EOF\nexit 0\nfi\n{}\n",
            describe, body
        )
    }

    /// Write [`script_plugin`] as an executable named `name`.
    pub fn write_script_plugin(dir: &Path, name: &str, describe: &str, body: &str) -> PathBuf {
        write_executable(dir, name, &script_plugin(describe, body))
    }

    /// Describe JSON for a plugin with a single `install` command.
    pub fn describe_json(name: &str, version: &str) -> String {
        serde_json::json!({
            "protocol_version": 1,
            "name": name,
            "version": version,
            "description": format!("{} test plugin", name),
            "tags": ["package-manager"],
            "commands": [{
                "name": "install",
                "description": "Install packages",
                "usage": "install <package>...",
                "flags": [{"name": "yes", "shorthand": "y", "description": "Assume yes"}]
            }]
        })
        .to_string()
    }

    pub fn write_executable(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
