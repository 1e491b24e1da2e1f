//! Endpoint intent persistence
//!
//! Persists per-endpoint configuration to `<data_dir>/endpoints.json` and the
//! daemon's last published status to `<data_dir>/status.json`.

use crate::{AuthStatus, BannerEntry, EndpointOptions, PortRow, Result};
use chrono::{DateTime, Utc};
use ngext_config::GlobalConfig;
use ngext_provider::EndpointKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STORE_FILE: &str = "endpoints.json";
pub const STATUS_FILE: &str = "status.json";

/// Write content to a file atomically using a temp-file-then-rename pattern.
///
/// A crash during the write leaves the old file intact.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Run `f` while holding an exclusive lock for `path`.
///
/// The lock lives in a sibling `*.lock` file and is released when the closure
/// returns.
pub(crate) fn with_path_lock<T, F>(path: &Path, f: F) -> std::io::Result<T>
where
    F: FnOnce() -> std::io::Result<T>,
{
    let _lock = acquire_lock(path)?;
    f()
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

struct PathLockGuard {
    lock_path: PathBuf,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

const LOCK_RETRY: Duration = Duration::from_millis(25);
const LOCK_ATTEMPTS: u32 = 60;

/// A lock file older than this was left by a process that died holding it
const STALE_LOCK_AGE: Duration = Duration::from_secs(1);

fn acquire_lock(path: &Path) -> std::io::Result<PathLockGuard> {
    let lock_path = lock_path_for(path);
    for _ in 0..LOCK_ATTEMPTS {
        match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&lock_path)
        {
            Ok(_) => return Ok(PathLockGuard { lock_path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(&lock_path) {
                    tracing::warn!("Removing stale lock {}", lock_path.display());
                    let _ = std::fs::remove_file(&lock_path);
                    continue;
                }
                std::thread::sleep(LOCK_RETRY);
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("timed out waiting for lock {}", lock_path.display()),
    ))
}

fn lock_is_stale(lock_path: &Path) -> bool {
    std::fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Map key of an endpoint in the store file
pub fn store_key(key: &EndpointKey) -> String {
    format!("{}:{}", key.container_id, key.port)
}

/// What the user chose for one container port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub container_id: String,
    /// Name at the time of the last edit, for display when the container is gone
    pub container_name: String,
    pub port: u16,
    pub enabled: bool,
    #[serde(default)]
    pub options: EndpointOptions,
    pub updated_at: DateTime<Utc>,
}

impl EndpointConfig {
    pub fn new(
        key: &EndpointKey,
        container_name: impl Into<String>,
        enabled: bool,
        options: EndpointOptions,
    ) -> Self {
        Self {
            container_id: key.container_id.0.clone(),
            container_name: container_name.into(),
            port: key.port,
            enabled,
            options,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(self.container_id.clone(), self.port)
    }

    /// Same user-visible configuration, ignoring timestamps and names
    pub fn same_intent(&self, other: &EndpointConfig) -> bool {
        self.enabled == other.enabled && self.options == other.options
    }
}

/// Store of endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EndpointStore {
    /// Version for forward compatibility
    pub version: u32,
    /// Endpoint configs indexed by `<container id>:<port>`
    pub endpoints: HashMap<String, EndpointConfig>,
}

impl EndpointStore {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            endpoints: HashMap::new(),
        }
    }

    /// Load the store from the default location
    pub fn load() -> Result<Self> {
        let path = Self::store_path()?;
        Self::load_from(&path)
    }

    /// Load the store from a specific path; a missing file is an empty store
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = std::fs::read_to_string(path)?;
        let store: Self = serde_json::from_str(&content)?;

        if store.version > Self::CURRENT_VERSION {
            tracing::warn!(
                "Endpoint store version {} is newer than supported version {}",
                store.version,
                Self::CURRENT_VERSION
            );
        }

        Ok(store)
    }

    /// Save the store to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::store_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        atomic_write(path, content.as_bytes())?;

        Ok(())
    }

    /// Load, modify and save the store at `path` while holding its lock
    pub fn update_at<T, F>(path: &Path, f: F) -> Result<T>
    where
        F: FnOnce(&mut EndpointStore) -> T,
    {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let result = with_path_lock(path, || {
            let mut store = Self::load_from(path).map_err(std::io::Error::other)?;
            let out = f(&mut store);
            let content = serde_json::to_string_pretty(&store).map_err(std::io::Error::other)?;
            atomic_write(path, content.as_bytes())?;
            Ok(out)
        })?;
        Ok(result)
    }

    /// Default location of the store file
    pub fn store_path() -> Result<PathBuf> {
        Ok(GlobalConfig::data_dir()?.join(STORE_FILE))
    }

    pub fn get(&self, key: &EndpointKey) -> Option<&EndpointConfig> {
        self.endpoints.get(&store_key(key))
    }

    pub fn get_mut(&mut self, key: &EndpointKey) -> Option<&mut EndpointConfig> {
        self.endpoints.get_mut(&store_key(key))
    }

    pub fn upsert(&mut self, config: EndpointConfig) {
        self.endpoints.insert(store_key(&config.key()), config);
    }

    pub fn remove(&mut self, key: &EndpointKey) -> Option<EndpointConfig> {
        self.endpoints.remove(&store_key(key))
    }

    /// All configs ordered by key
    pub fn list(&self) -> Vec<&EndpointConfig> {
        let mut all: Vec<&EndpointConfig> = self.endpoints.values().collect();
        all.sort_by_key(|c| c.key());
        all
    }

    pub fn enabled(&self) -> Vec<&EndpointConfig> {
        self.list().into_iter().filter(|c| c.enabled).collect()
    }

    /// Mark every endpoint of `container_id` disabled; returns how many changed
    pub fn disable_container(&mut self, container_id: &str) -> usize {
        let mut changed = 0;
        for config in self.endpoints.values_mut() {
            if config.container_id == container_id && config.enabled {
                config.enabled = false;
                config.updated_at = Utc::now();
                changed += 1;
            }
        }
        changed
    }
}

/// What the daemon last published, read by one-shot CLI commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
    pub auth: AuthStatus,
    pub rows: Vec<PortRow>,
    pub banner: Vec<BannerEntry>,
}

impl StatusSnapshot {
    /// Default location of the status file
    pub fn status_path() -> Result<PathBuf> {
        Ok(GlobalConfig::data_dir()?.join(STATUS_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        atomic_write(path, content.as_bytes())?;
        Ok(())
    }

    /// Load a snapshot; `None` if no daemon ever wrote one
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Written within `max_age` of `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now - self.updated_at <= max_age,
            Err(_) => true,
        }
    }

    /// Find the row of a container port
    pub fn row(&self, key: &EndpointKey) -> Option<&PortRow> {
        self.rows.iter().find(|r| &r.key == key && r.tunnelable)
    }
}
