// Settings and short-lived cache storage
// Durable key-value settings (memory or JSON file) + TTL cache ("transients")

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex.lock().map_err(|_| StoreError::Poisoned)
}

// ============ Clock ============

/// Time source for expiry computations
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

// ============ Traits ============

/// Durable key-value settings
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Write several keys as one unit. Backends that persist per write should override.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Delete several keys as one unit.
    fn delete_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }
}

/// Short-lived values that disappear after their TTL
pub trait EphemeralCache: Send + Sync {
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Absent once the TTL has elapsed
    fn get(&self, key: &str) -> Option<String>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

// ============ In-memory backends ============

/// Settings kept in process memory
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.values)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.values)?.remove(key);
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut values = lock(&self.values)?;
        for (key, value) in entries {
            values.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn delete_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut values = lock(&self.values)?;
        for key in keys {
            values.remove(*key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CacheRecord {
    fn new(value: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            value: value.to_string(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// TTL cache kept in process memory
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralCache for MemoryCache {
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let record = CacheRecord::new(value, ttl, self.clock.now());
        lock(&self.entries)?.insert(key.to_string(), record);
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut entries = lock(&self.entries).ok()?;
        let (live, value) = entries
            .get(key)
            .map(|record| (record.is_live(now), record.value.clone()))?;
        if live {
            Some(value)
        } else {
            entries.remove(key);
            None
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries)?.remove(key);
        Ok(())
    }
}

// ============ JSON file backend ============

/// Owner-only permissions (0o600 files, 0o700 dirs on Unix)
pub fn ensure_secure_permissions(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if path.is_dir() { 0o700 } else { 0o600 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Create or truncate `path` readable by the owner only, then write `content`
fn write_private(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    // A leftover temp file keeps its old mode; `mode()` only applies on create
    ensure_secure_permissions(path)
}

/// Settings persisted as a single JSON object on disk
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileSettings {
    /// Open (or lazily create) the settings file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)
                    .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e)))?
            }
        } else {
            HashMap::new()
        };
        debug!("Opened settings file {:?} ({} keys)", path, values.len());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Default location: `<config_dir>/edd-dropbox/settings.json`
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
        config_dir.join("edd-dropbox").join("settings.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole map through an owner-only temp file + rename
    fn persist(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                ensure_secure_permissions(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(values)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        write_private(&tmp, content.as_bytes())?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let mut values = lock(&self.values)?;
        let mut next = values.clone();
        mutate(&mut next);
        self.persist(&next).map_err(|e| {
            warn!("Failed to persist settings to {:?}: {}", self.path, e);
            e
        })?;
        *values = next;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        if lock(&self.values)?.contains_key(key) {
            self.update(|values| {
                values.remove(key);
            })
        } else {
            Ok(())
        }
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        self.update(|values| {
            for (key, value) in entries {
                values.insert(key.to_string(), value.to_string());
            }
        })
    }

    fn delete_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.update(|values| {
            for key in keys {
                values.remove(*key);
            }
        })
    }
}

// ============ Settings-backed TTL cache ============

const TRANSIENT_PREFIX: &str = "_transient_";

/// TTL cache stored inside a durable settings store, so values survive restarts
/// but still expire.
pub struct TransientCache<S: SettingsStore> {
    settings: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: SettingsStore> TransientCache<S> {
    pub fn new(settings: Arc<S>) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", TRANSIENT_PREFIX, key)
    }

    /// Drop a dead entry; a failure only leaves it for the next read
    fn purge(&self, storage_key: &str) {
        if let Err(e) = self.settings.delete(storage_key) {
            warn!("Failed to purge cache entry {}: {}", storage_key, e);
        }
    }
}

impl<S: SettingsStore> EphemeralCache for TransientCache<S> {
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let record = CacheRecord::new(value, ttl, self.clock.now());
        let encoded = serde_json::to_string(&record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.settings.set(&Self::storage_key(key), &encoded)
    }

    fn get(&self, key: &str) -> Option<String> {
        let storage_key = Self::storage_key(key);
        let raw = self.settings.get(&storage_key)?;
        match serde_json::from_str::<CacheRecord>(&raw) {
            Ok(record) if record.is_live(self.clock.now()) => Some(record.value),
            Ok(_) => {
                self.purge(&storage_key);
                None
            }
            Err(e) => {
                warn!("Discarding unreadable cache entry {}: {}", key, e);
                self.purge(&storage_key);
                None
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.settings.delete(&Self::storage_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_settings_roundtrip() {
        let store = MemorySettings::new();
        assert_eq!(store.get_or("missing", "fallback"), "fallback");

        store.set("a", "1").unwrap();
        store.set_many(&[("b", "2"), ("c", "3")]).unwrap();
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(store.get("c").as_deref(), Some("3"));

        store.delete_many(&["a", "b"]).unwrap();
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_none());
        assert_eq!(store.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_memory_cache_expires_with_clock() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemoryCache::with_clock(clock.clone());

        cache.set("k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        clock.advance(Duration::from_secs(1));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_memory_cache_zero_ttl_is_never_live() {
        let cache = MemoryCache::with_clock(Arc::new(ManualClock::default()));
        cache.set("k", "v", Duration::ZERO).unwrap();
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_json_file_settings_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = JsonFileSettings::open(&path).unwrap();
        store.set_many(&[("app_key", "key"), ("app_secret", "secret")]).unwrap();
        store.delete("app_secret").unwrap();
        drop(store);

        let reopened = JsonFileSettings::open(&path).unwrap();
        assert_eq!(reopened.get("app_key").as_deref(), Some("key"));
        assert!(reopened.get("app_secret").is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_file_settings_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileSettings::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_transient_cache_survives_reopen_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let clock = Arc::new(ManualClock::default());

        {
            let settings = Arc::new(JsonFileSettings::open(&path).unwrap());
            let cache = TransientCache::with_clock(settings, clock.clone());
            cache.set("oauth_state", "nonce", Duration::from_secs(600)).unwrap();
        }

        let settings = Arc::new(JsonFileSettings::open(&path).unwrap());
        let cache = TransientCache::with_clock(settings.clone(), clock.clone());
        assert_eq!(cache.get("oauth_state").as_deref(), Some("nonce"));

        clock.advance(Duration::from_secs(601));
        assert!(cache.get("oauth_state").is_none());
        // Expired record is purged from the backing store
        assert!(settings.get("_transient_oauth_state").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_json_file_settings_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("edd-dropbox");
        let path = parent.join("settings.json");

        let store = JsonFileSettings::open(&path).unwrap();
        store.set("dropbox_access_token", "secret-token").unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = std::fs::metadata(&parent).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn test_json_file_settings_tightens_leftover_temp_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, "{}").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = JsonFileSettings::open(&path).unwrap();
        store.set("dropbox_refresh_token", "r").unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    /// Settings whose deletes always fail
    #[derive(Default)]
    struct ReadOnlyDeletes {
        inner: MemorySettings,
    }

    impl SettingsStore for ReadOnlyDeletes {
        fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set(key, value)
        }

        fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }
    }

    #[test]
    fn test_transient_cache_failed_purge_still_reads_absent() {
        let clock = Arc::new(ManualClock::default());
        let settings = Arc::new(ReadOnlyDeletes::default());
        let cache = TransientCache::with_clock(settings.clone(), clock.clone());

        cache.set("k", "v", Duration::from_secs(10)).unwrap();
        clock.advance(Duration::from_secs(11));
        assert!(cache.get("k").is_none());
        // Purge failed, so the record is still there but stays unreadable
        assert!(settings.get("_transient_k").is_some());
        assert!(cache.get("k").is_none());

        settings.set("_transient_bad", "not json").unwrap();
        assert!(cache.get("bad").is_none());
    }
}
