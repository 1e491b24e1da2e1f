//! Global configuration for ngext
//!
//! Located at `~/.config/ngext/config.toml`

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the data directory
pub const STATE_DIR_ENV: &str = "NGEXT_STATE_DIR";

/// Global ngext configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub docker: DockerConfig,
    pub ngrok: NgrokConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub registry: RegistryConfig,
}

/// Docker host connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker socket path or URL
    pub socket: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
        }
    }
}

#[cfg(windows)]
fn default_docker_socket() -> String {
    "//./pipe/docker_engine".to_string()
}

#[cfg(target_os = "macos")]
fn default_docker_socket() -> String {
    // Docker Desktop puts its socket in the user's home on macOS
    dirs::home_dir()
        .map(|h| format!("{}/.docker/run/docker.sock", h.display()))
        .unwrap_or_else(|| "/var/run/docker.sock".to_string())
}

#[cfg(all(not(windows), not(target_os = "macos")))]
fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

/// ngrok agent and API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NgrokConfig {
    /// ngrok agent executable, started with the stored auth token
    pub agent_binary: String,
    /// Base URL the agent's local API is served on
    pub agent_api: String,
    /// Scheme used when a port's protocol cannot be detected ("http", "https" or "tcp")
    pub default_scheme: String,
    /// Probe published ports to pick http, https or tcp per port
    pub detect_scheme: bool,
}

impl Default for NgrokConfig {
    fn default() -> Self {
        Self {
            agent_binary: "ngrok".to_string(),
            agent_api: "http://127.0.0.1:4040".to_string(),
            default_scheme: "http".to_string(),
            detect_scheme: true,
        }
    }
}

impl NgrokConfig {
    /// `host:port` of `agent_api`, where the agent is told to listen
    pub fn agent_web_addr(&self) -> Option<String> {
        let rest = self.agent_api.strip_prefix("http://")?;
        let addr = rest.trim_end_matches('/');
        (!addr.is_empty() && !addr.contains('/')).then(|| addr.to_string())
    }
}

/// Timing and concurrency of the sync loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Container list refresh interval
    pub poll_interval_secs: u64,
    /// How often the daemon validates the stored token with ngrok again
    pub auth_check_interval_secs: u64,
    /// How often the daemon re-reads the endpoint store
    pub reload_interval_ms: u64,
    /// Quiet period before an options edit is committed
    pub debounce_ms: u64,
    /// Timeout applied to every external call
    pub call_timeout_secs: u64,
    /// Maximum simultaneous tunnel calls across all endpoints
    pub max_in_flight: usize,
    /// Upper bound on draining tunnel deletions at shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            auth_check_interval_secs: 300,
            reload_interval_ms: 1000,
            debounce_ms: 500,
            call_timeout_secs: 15,
            max_in_flight: 5,
            shutdown_timeout_secs: 10,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn auth_check_interval(&self) -> Duration {
        Duration::from_secs(self.auth_check_interval_secs)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Automatic retry of failed tunnel calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Automatic retries after the first failed create/update
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt
    pub factor: u32,
    /// Backoff cap
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay_ms: 1000,
            factor: 2,
            max_delay_secs: 30,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay_secs`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let cap = Duration::from_secs(self.max_delay_secs);
        let mut delay = base;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= cap {
                return cap;
            }
        }
        delay.min(cap)
    }
}

/// Container discovery filters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Containers carrying this label are never listed (the extension itself)
    pub exclude_label: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            exclude_label: "com.docker.desktop.extension.api.version".to_string(),
        }
    }
}

impl GlobalConfig {
    /// Load global configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load global configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.clone(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.clone(),
            source: e,
        })?;
        config.validate()?;

        tracing::debug!(
            "Loaded config from {:?}: agent_api={}, poll={}s",
            path,
            config.ngrok.agent_api,
            config.sync.poll_interval_secs
        );

        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.clone(),
                source: e,
            })?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.clone(),
            source: e,
        })
    }

    /// Reject settings the sync loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sync.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync.reload_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.reload_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.sync.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_in_flight must be greater than 0".to_string(),
            ));
        }
        if self.sync.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.call_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync.auth_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.auth_check_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.ngrok.agent_web_addr().is_none() {
            return Err(ConfigError::Invalid(format!(
                "ngrok.agent_api must look like http://host:port (got '{}')",
                self.ngrok.agent_api
            )));
        }
        if self.retry.factor == 0 {
            return Err(ConfigError::Invalid("retry.factor must be at least 1".to_string()));
        }
        match self.ngrok.default_scheme.as_str() {
            "http" | "https" | "tcp" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "ngrok.default_scheme must be http, https or tcp (got '{}')",
                other
            ))),
        }
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "ngext").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path, honoring `NGEXT_STATE_DIR`
    pub fn data_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        let dirs = ProjectDirs::from("", "", "ngext").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Check if the config file exists on disk
    pub fn config_exists() -> bool {
        Self::config_path()
            .map(|p| p.exists())
            .unwrap_or(false)
    }
}
