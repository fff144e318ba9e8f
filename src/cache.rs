//! Time-bounded cache over platform detection and the required-plugin list.
//!
//! The cache has two independent slots guarded by one reader/writer lock.
//! Values go in and come out as clones, so callers never share storage with
//! the cache. Entries are served only while `now - observed_at < ttl`.
//!
//! A cache can be persisted to a small JSON file so that CLI invocations
//! close together in time share one detection window.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DevstrapError, Result};
use crate::platform::Platform;

/// Default time-to-live for both slots.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward (or backward, with a negative duration).
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A cached value and the moment it was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub observed_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    /// Whether this entry may no longer be served.
    ///
    /// An entry stamped in the future (the clock moved backwards) is treated
    /// as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now - self.observed_at;
        age < Duration::zero() || age >= ttl
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Slots {
    #[serde(default)]
    platform: Option<CacheEntry<Platform>>,
    #[serde(default)]
    plugins: Option<CacheEntry<Vec<String>>>,
}

/// Two-slot TTL cache used by the bootstrap.
pub struct BootstrapCache {
    slots: RwLock<Slots>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl BootstrapCache {
    /// Create an empty cache.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            ttl,
            clock,
        }
    }

    /// Empty cache with the default 24h TTL and the system clock.
    pub fn with_defaults() -> Self {
        Self::new(Duration::hours(DEFAULT_TTL_HOURS), Arc::new(SystemClock))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached platform, if present and fresh.
    pub fn get_platform(&self) -> Option<Platform> {
        let now = self.clock.now();
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        fresh(slots.platform.as_ref(), now, self.ttl)
    }

    /// Replace the platform slot, stamping it with the current time.
    pub fn set_platform(&self, platform: &Platform) {
        let entry = CacheEntry {
            value: platform.clone(),
            observed_at: self.clock.now(),
        };
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.platform = Some(entry);
    }

    /// The cached required-plugin list, if present and fresh.
    pub fn get_plugins(&self) -> Option<Vec<String>> {
        let now = self.clock.now();
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        fresh(slots.plugins.as_ref(), now, self.ttl)
    }

    /// Replace the required-plugin slot, stamping it with the current time.
    pub fn set_plugins(&self, plugins: &[String]) {
        let entry = CacheEntry {
            value: plugins.to_vec(),
            observed_at: self.clock.now(),
        };
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.plugins = Some(entry);
    }

    /// Drop both slots.
    pub fn clear(&self) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        *slots = Slots::default();
    }

    /// When each slot was last observed, for status output.
    pub fn observed_at(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        (
            slots.platform.as_ref().map(|e| e.observed_at),
            slots.plugins.as_ref().map(|e| e.observed_at),
        )
    }

    /// Load a persisted cache.
    ///
    /// A missing, unreadable or corrupt file yields an empty cache; stale
    /// entries are kept on load and simply never served.
    pub fn load(path: &Path, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let cache = Self::new(ttl, clock);
        let slots = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Slots>(&content) {
                Ok(slots) => slots,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Ignoring corrupt bootstrap cache");
                    Slots::default()
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No bootstrap cache loaded");
                Slots::default()
            }
        };
        *cache.slots.write().unwrap_or_else(|e| e.into_inner()) = slots;
        cache
    }

    /// Persist both slots as JSON, writing through a temp file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*slots)?
        };

        let parent = path.parent().ok_or_else(|| {
            DevstrapError::Config(format!("Cache path has no parent: {}", path.display()))
        })?;
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(path).map_err(|e| DevstrapError::Io(e.error))?;
        Ok(())
    }
}

impl Default for BootstrapCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn fresh<T: Clone>(entry: Option<&CacheEntry<T>>, now: DateTime<Utc>, ttl: Duration) -> Option<T> {
    entry
        .filter(|e| !e.is_expired(now, ttl))
        .map(|e| e.value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_platform() -> Platform {
        Platform {
            os: "linux".to_string(),
            distribution: "ubuntu".to_string(),
            version: "22.04".to_string(),
            desktop_env: "gnome".to_string(),
            architecture: "amd64".to_string(),
            package_managers: vec!["apt".to_string()],
        }
    }

    fn manual_cache() -> (BootstrapCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = BootstrapCache::new(Duration::hours(24), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_empty_cache_misses() {
        let (cache, _) = manual_cache();
        assert!(cache.get_platform().is_none());
        assert!(cache.get_plugins().is_none());
    }

    #[test]
    fn test_platform_round_trip_is_a_copy() {
        let (cache, _) = manual_cache();
        let mut original = sample_platform();
        cache.set_platform(&original);

        let mut fetched = cache.get_platform().expect("fresh entry");
        assert_eq!(fetched, original);

        // Mutating either side leaves the cached value untouched.
        fetched.package_managers.push("snap".to_string());
        original.distribution = "debian".to_string();
        assert_eq!(cache.get_platform().unwrap(), sample_platform());
    }

    #[test]
    fn test_platform_expires_at_ttl() {
        let (cache, clock) = manual_cache();
        cache.set_platform(&sample_platform());

        clock.advance(Duration::hours(24) - Duration::seconds(1));
        assert!(cache.get_platform().is_some());

        clock.advance(Duration::seconds(1));
        assert!(cache.get_platform().is_none());
    }

    #[test]
    fn test_slots_are_independent() {
        let (cache, clock) = manual_cache();
        cache.set_platform(&sample_platform());
        clock.advance(Duration::hours(12));
        cache.set_plugins(&["apt".to_string(), "mise".to_string()]);
        clock.advance(Duration::hours(12));

        assert!(cache.get_platform().is_none());
        assert_eq!(
            cache.get_plugins(),
            Some(vec!["apt".to_string(), "mise".to_string()])
        );
    }

    #[test]
    fn test_set_overwrites_value_and_timestamp() {
        let (cache, clock) = manual_cache();
        cache.set_plugins(&["old".to_string()]);
        clock.advance(Duration::hours(23));
        cache.set_plugins(&["new".to_string()]);
        clock.advance(Duration::hours(23));
        assert_eq!(cache.get_plugins(), Some(vec!["new".to_string()]));
    }

    #[test]
    fn test_clock_moving_backwards_expires() {
        let (cache, clock) = manual_cache();
        cache.set_platform(&sample_platform());
        clock.advance(Duration::minutes(-5));
        assert!(cache.get_platform().is_none());
    }

    #[test]
    fn test_clear() {
        let (cache, _) = manual_cache();
        cache.set_platform(&sample_platform());
        cache.set_plugins(&["apt".to_string()]);
        cache.clear();
        assert!(cache.get_platform().is_none());
        assert!(cache.get_plugins().is_none());
        assert_eq!(cache.observed_at(), (None, None));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache").join("bootstrap.json");
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let cache = BootstrapCache::new(Duration::hours(24), clock.clone());
        cache.set_platform(&sample_platform());
        cache.set_plugins(&["apt".to_string()]);
        cache.save(&path).unwrap();

        let loaded = BootstrapCache::load(&path, Duration::hours(24), clock.clone());
        assert_eq!(loaded.get_platform(), Some(sample_platform()));
        assert_eq!(loaded.get_plugins(), Some(vec!["apt".to_string()]));

        clock.advance(Duration::hours(25));
        let loaded = BootstrapCache::load(&path, Duration::hours(24), clock);
        assert!(loaded.get_platform().is_none());
    }

    #[test]
    fn test_load_corrupt_or_missing_is_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bootstrap.json");
        std::fs::write(&path, "{not json").unwrap();

        let cache = BootstrapCache::load(&path, Duration::hours(1), Arc::new(SystemClock));
        assert!(cache.get_platform().is_none());

        let cache = BootstrapCache::load(
            &tmp.path().join("missing.json"),
            Duration::hours(1),
            Arc::new(SystemClock),
        );
        assert!(cache.get_plugins().is_none());
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(BootstrapCache::with_defaults());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if i % 2 == 0 {
                            cache.set_plugins(&[format!("p{}", i)]);
                        } else {
                            let _ = cache.get_plugins();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.get_plugins().map(|p| p.len()), Some(1));
    }
}
