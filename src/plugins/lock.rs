//! Per-plugin install locks.
//!
//! Installing plugin `<name>` holds `<plugin_dir>/.<name>.lock`, created
//! exclusively and containing the owner's PID. A second installer of the same
//! name (in this process or another) waits for the lock; installs of
//! different names never contend.
//!
//! Locks left behind by a process that no longer runs are reclaimed. On
//! systems without `/proc` liveness cannot be checked, so a lock older than
//! [`STALE_LOCK_AGE`] is treated as abandoned.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::error::{DevstrapError, Result};
use crate::security::plugin_lock_path;

/// Age after which an unverifiable lock is considered abandoned.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(60 * 60);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock guard that removes the lock file on drop.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
}

impl InstallLock {
    /// Acquire the install lock for `name`, waiting up to `wait` for a live
    /// holder to release it.
    pub async fn acquire(plugin_dir: &Path, name: &str, wait: Duration) -> Result<Self> {
        let path = plugin_lock_path(plugin_dir, name)?.into_path_buf();
        let started = Instant::now();

        loop {
            match try_create(&path) {
                Ok(()) => {
                    debug!(plugin = %name, lock = %path.display(), "Acquired install lock");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match inspect(&path) {
                        LockState::Gone => continue,
                        LockState::Stale(observed) => {
                            warn!(
                                plugin = %name,
                                lock = %path.display(),
                                "Reclaiming stale install lock"
                            );
                            reclaim(&path, &observed);
                            continue;
                        }
                        LockState::Held => {}
                    }
                    if started.elapsed() >= wait {
                        return Err(DevstrapError::Busy(format!(
                            "another install of '{}' holds {}",
                            name,
                            path.display()
                        )));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(DevstrapError::Setup(format!(
                        "Failed to create lock file {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(std::process::id().to_string().as_bytes())?;
    Ok(())
}

/// What a lock file looked like when it was judged stale.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observed {
    content: String,
    modified: Option<SystemTime>,
}

impl Observed {
    fn read(path: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(Self { content, modified })
    }
}

#[derive(Debug)]
enum LockState {
    /// Removed by its owner between `create_new` and inspection.
    Gone,
    Stale(Observed),
    Held,
}

fn inspect(path: &Path) -> LockState {
    let observed = match Observed::read(path) {
        Ok(observed) => observed,
        Err(e) if e.kind() == ErrorKind::NotFound => return LockState::Gone,
        Err(_) => return LockState::Held,
    };

    let stale = match observed.content.trim().parse::<u32>() {
        Ok(pid) => match is_process_running(pid) {
            Some(running) => !running,
            None => older_than(path, STALE_LOCK_AGE),
        },
        // Written but not yet filled by its owner, or garbage.
        Err(_) => older_than(path, Duration::from_secs(5)),
    };

    if stale {
        LockState::Stale(observed)
    } else {
        LockState::Held
    }
}

static RECLAIM_SEQ: AtomicU64 = AtomicU64::new(0);

/// Move a stale lock aside and delete it.
///
/// Another waiter may have reclaimed the same lock and created a fresh one
/// in the meantime. The rename takes whatever file is at `path`, so the
/// moved file is compared with `observed` and restored when it differs.
fn reclaim(path: &Path, observed: &Observed) {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let aside = path.with_file_name(format!(
        "{}.{}-{}.stale",
        file_name,
        std::process::id(),
        RECLAIM_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    if fs::rename(path, &aside).is_err() {
        // Already reclaimed by someone else.
        return;
    }

    match Observed::read(&aside) {
        Ok(moved) if moved == *observed => {}
        Ok(_) => {
            debug!(lock = %path.display(), "Lock changed hands during reclaim, restoring");
            if let Err(e) = fs::hard_link(&aside, path) {
                warn!("Failed to restore lock file {}: {}", path.display(), e);
            }
        }
        Err(_) => {}
    }
    let _ = fs::remove_file(&aside);
}

/// `Some(running)` where `/proc` is available, `None` when liveness cannot
/// be determined.
fn is_process_running(pid: u32) -> Option<bool> {
    if !Path::new("/proc/self").exists() {
        return None;
    }
    Some(Path::new(&format!("/proc/{}", pid)).exists())
}

fn older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed >= age)
}
