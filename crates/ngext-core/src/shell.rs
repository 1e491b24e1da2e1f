//! Application shell
//!
//! `AppShell` owns every piece of state: auth, the container registry, the
//! reconciler, pending option edits and the committed endpoint intents. It
//! gates the dashboard behind auth, turns intents into desired tunnels, and
//! collects failures into a single error banner.

use crate::{
    derive_spec, validate, AuthState, AuthStatus, Completion, ContainerRegistry, CoreError,
    Debouncer, EndpointConfig, EndpointError, EndpointOptions, EndpointStore, PortRow,
    ReconcileEvent, Reconciler, ReconcilerSettings, RegistryDiff, Result, StatusSnapshot,
};
use chrono::{DateTime, Utc};
use ngext_config::GlobalConfig;
use ngext_provider::{ContainerHost, EndpointKey, ExposedPort, TunnelService, TunnelSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

const IDLE_WAKE: Duration = Duration::from_secs(60);

/// What a banner entry is about; one entry per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerKey {
    Endpoint(EndpointKey),
    /// An options change that could not be saved
    Save(EndpointKey),
    /// Container listing
    Host,
    /// Auth check
    Auth,
}

impl std::fmt::Display for BannerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Endpoint(key) => write!(f, "{}", key),
            Self::Save(key) => write!(f, "{} (not saved)", key),
            Self::Host => write!(f, "docker"),
            Self::Auth => write!(f, "auth"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannerEntry {
    pub key: BannerKey,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Unresolved failures, one per key
#[derive(Debug, Default)]
pub struct ErrorBanner {
    entries: Vec<BannerEntry>,
}

impl ErrorBanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message for `key`, replacing any previous one
    pub fn set(&mut self, key: BannerKey, message: impl Into<String>) {
        self.insert(BannerEntry {
            key,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn clear(&mut self, key: &BannerKey) {
        self.entries.retain(|e| &e.key != key);
    }

    /// Replace every endpoint entry with the reconciler's current errors
    pub fn sync_endpoints(&mut self, errors: Vec<EndpointError>) {
        self.entries
            .retain(|e| !matches!(e.key, BannerKey::Endpoint(_)));
        for error in errors {
            self.insert(BannerEntry {
                key: BannerKey::Endpoint(error.key.clone()),
                message: error.to_string(),
                at: error.at,
            });
        }
    }

    /// Entries, most recent first
    pub fn entries(&self) -> Vec<BannerEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| b.at.cmp(&a.at));
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, entry: BannerEntry) {
        self.entries.retain(|e| e.key != entry.key);
        self.entries.push(entry);
    }
}

/// What the UI should render
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellView {
    Setup {
        last_error: Option<String>,
    },
    Dashboard {
        rows: Vec<PortRow>,
        banner: Vec<BannerEntry>,
    },
}

/// Files the shell persists to
#[derive(Debug, Clone)]
pub struct ShellPaths {
    pub store: PathBuf,
    pub status: PathBuf,
}

impl ShellPaths {
    /// Default files under the data directory
    pub fn from_data_dir() -> Result<Self> {
        Ok(Self {
            store: EndpointStore::store_path()?,
            status: StatusSnapshot::status_path()?,
        })
    }
}

pub struct AppShell {
    config: GlobalConfig,
    host: Arc<dyn ContainerHost>,
    auth: AuthState,
    registry: ContainerRegistry,
    reconciler: Reconciler,
    debouncer: Debouncer<EndpointKey, EndpointOptions>,
    /// Committed endpoint intents
    intents: EndpointStore,
    /// Detected scheme per port; ports missing here use the configured default
    schemes: HashMap<EndpointKey, String>,
    banner: ErrorBanner,
    paths: Option<ShellPaths>,
}

impl AppShell {
    /// Create a shell over in-memory intents
    pub fn new(
        config: GlobalConfig,
        host: Arc<dyn ContainerHost>,
        service: Arc<dyn TunnelService>,
        intents: EndpointStore,
    ) -> Self {
        let settings = ReconcilerSettings::from_config(&config);
        Self {
            auth: AuthState::new(host.clone(), service.clone()),
            registry: ContainerRegistry::new(),
            reconciler: Reconciler::new(service, settings),
            debouncer: Debouncer::new(config.sync.debounce()),
            intents,
            schemes: HashMap::new(),
            banner: ErrorBanner::new(),
            paths: None,
            host,
            config,
        }
    }

    /// Create a shell persisting intents and status under `paths`
    pub fn open(
        config: GlobalConfig,
        host: Arc<dyn ContainerHost>,
        service: Arc<dyn TunnelService>,
        paths: ShellPaths,
    ) -> Result<Self> {
        let intents = EndpointStore::load_from(&paths.store)?;
        let mut shell = Self::new(config, host, service, intents);
        shell.paths = Some(paths);
        Ok(shell)
    }

    pub fn auth_status(&self) -> AuthStatus {
        self.auth.status()
    }

    pub fn is_setup(&self) -> bool {
        self.auth.is_setup()
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn intents(&self) -> &EndpointStore {
        &self.intents
    }

    pub fn banner(&self) -> &ErrorBanner {
        &self.banner
    }

    /// Options waiting in the debounce window for `key`
    pub fn pending_options(&self, key: &EndpointKey) -> Option<&EndpointOptions> {
        self.debouncer.pending(key)
    }

    /// Initial auth check and container listing
    pub async fn start(&mut self) {
        self.check_auth().await;
        self.refresh_containers().await;
    }

    /// Re-check the stored token; failures go to the banner
    pub async fn check_auth(&mut self) -> AuthStatus {
        let status = match self.auth.check_auth().await {
            Ok(status) => {
                self.banner.clear(&BannerKey::Auth);
                status
            }
            Err(e) => {
                self.banner.set(BannerKey::Auth, e.to_string());
                self.auth.status()
            }
        };
        self.reconciler.set_gate(status.is_setup);
        status
    }

    /// Validate and store a token, then load the dashboard
    pub async fn complete_setup(&mut self, token: &str) -> Result<()> {
        self.auth.complete_setup(token).await?;
        self.banner.clear(&BannerKey::Auth);
        self.reconciler.set_gate(true);
        self.refresh_containers().await;
        Ok(())
    }

    /// Forget the token and return to the setup flow
    pub async fn reset_auth(&mut self) -> Result<()> {
        self.auth.reset().await?;
        self.reconciler.set_gate(false);
        Ok(())
    }

    /// One poll tick: check auth again if the stored token changed, then
    /// refresh the container list
    pub async fn poll(&mut self) {
        if !self.auth.is_setup() || self.auth.token_changed().await {
            self.check_auth().await;
        }
        self.refresh_containers().await;
    }

    /// Poll the host; skipped while ngrok is not set up
    pub async fn refresh_containers(&mut self) -> Option<RegistryDiff> {
        if !self.auth.is_setup() {
            return None;
        }
        let diff = match self.registry.refresh(self.host.as_ref()).await {
            Ok(diff) => diff,
            Err(e) => {
                self.banner.set(BannerKey::Host, e.to_string());
                return None;
            }
        };
        self.banner.clear(&BannerKey::Host);

        for container in &diff.removed {
            self.schemes.retain(|k, _| k.container_id != container.id);
            let keys = self.keys_of(&container.id.0);
            for key in &keys {
                self.debouncer.cancel(key);
            }
            self.reconciler.container_removed(&container.id);
            if self.intents.disable_container(&container.id.0) > 0 {
                self.persist_keys(&keys);
            }
        }

        if diff.initial {
            // Intents of containers that stopped while nobody was watching
            let stale: Vec<EndpointKey> = self
                .intents
                .enabled()
                .into_iter()
                .map(|c| c.key())
                .filter(|k| self.registry.get(&k.container_id).is_none())
                .collect();
            for key in &stale {
                tracing::info!("Disabling {}: its container is no longer running", key);
                if let Some(config) = self.intents.get_mut(key) {
                    config.enabled = false;
                    config.updated_at = Utc::now();
                }
            }
            self.persist_keys(&stale);
        }

        if self.config.ngrok.detect_scheme {
            self.detect_schemes(&diff).await;
        }

        if !diff.is_empty() {
            self.sync_desired();
        }
        Some(diff)
    }

    /// Detect the scheme of ports on new or changed containers
    async fn detect_schemes(&mut self, diff: &RegistryDiff) {
        let ports: Vec<(EndpointKey, ExposedPort)> = self
            .registry
            .containers()
            .iter()
            .filter(|c| diff.initial || diff.added.contains(&c.id) || diff.changed.contains(&c.id))
            .flat_map(|c| {
                c.ports
                    .iter()
                    .filter(|p| p.is_tunnelable())
                    .map(|p| (EndpointKey::new(c.id.0.clone(), p.port), p.clone()))
            })
            .collect();

        for (key, port) in ports {
            match self.host.detect_scheme(&port).await {
                Some(scheme) => {
                    tracing::debug!("{} speaks {}", key, scheme);
                    self.schemes.insert(key, scheme);
                }
                None => {
                    self.schemes.remove(&key);
                }
            }
        }
    }

    /// Turn tunneling on for a container port, committing immediately
    pub fn enable(&mut self, key: &EndpointKey, options: EndpointOptions) -> Result<()> {
        self.require_setup()?;
        let container_name = self.require_port(key)?;
        let options = options.normalized();
        validate(&options)?;

        self.debouncer.cancel(key);
        self.commit(EndpointConfig::new(key, container_name, true, options))?;
        tracing::info!("Enabled tunnel for {}", key);
        self.sync_key(key);
        Ok(())
    }

    /// Turn tunneling off; the options are kept for next time
    pub fn disable(&mut self, key: &EndpointKey) -> Result<()> {
        self.require_setup()?;
        self.debouncer.cancel(key);
        if let Some(current) = self.intents.get(key).filter(|c| c.enabled) {
            let mut config = current.clone();
            config.enabled = false;
            config.updated_at = Utc::now();
            self.commit(config)?;
            tracing::info!("Disabled tunnel for {}", key);
        }
        self.sync_key(key);
        Ok(())
    }

    /// Stage an options edit; it commits once the key has been quiet for the
    /// debounce window, or on `apply_now`.
    ///
    /// Invalid options are rejected here and never reach the reconciler.
    pub fn edit_options(&mut self, key: &EndpointKey, options: EndpointOptions) -> Result<()> {
        self.require_setup()?;
        self.require_port(key)?;
        let options = options.normalized();
        validate(&options)?;
        self.debouncer.edit(key.clone(), options, Instant::now());
        Ok(())
    }

    /// Commit the pending edit for `key` without waiting
    pub fn apply_now(&mut self, key: &EndpointKey) -> Result<bool> {
        match self.debouncer.take(key) {
            Some(options) => {
                self.commit_options(key, options)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Commit every edit whose quiet period elapsed at `now`
    pub fn flush_due(&mut self, now: Instant) {
        for (key, options) in self.debouncer.due(now) {
            if let Err(e) = self.commit_options(&key, options) {
                tracing::warn!("Failed to commit options for {}: {}", key, e);
                self.banner
                    .set(BannerKey::Save(key), format!("options not saved: {}", e));
            }
        }
    }

    /// Manual retry of an endpoint in error
    pub fn retry(&mut self, key: &EndpointKey) -> bool {
        let retried = self.reconciler.retry(key);
        self.banner.sync_endpoints(self.reconciler.errors());
        retried
    }

    /// Open the public URL of an active endpoint in the browser
    pub async fn open_url(&self, key: &EndpointKey) -> Result<String> {
        let url = self
            .reconciler
            .actual(key)
            .map(|a| a.info.url.clone())
            .ok_or_else(|| CoreError::NotActive(key.to_string()))?;
        self.host.open_external(&url).await?;
        Ok(url)
    }

    /// Record a finished tunnel call
    pub async fn handle_completion(&mut self, completion: Completion) -> Vec<ReconcileEvent> {
        let events = self.reconciler.handle_completion(completion);
        let mut auth_expired = false;
        for event in &events {
            match event {
                ReconcileEvent::Active { key, url } => tracing::info!("{} is live at {}", key, url),
                ReconcileEvent::Removed { key } => tracing::info!("Tunnel for {} stopped", key),
                ReconcileEvent::AuthExpired { .. } => auth_expired = true,
                ReconcileEvent::Failed(_) => {}
            }
        }
        if auth_expired {
            tracing::warn!("ngrok reported an expired token, checking auth again");
            self.check_auth().await;
        }
        self.banner.sync_endpoints(self.reconciler.errors());
        events
    }

    /// Handle timers: debounce deadlines and retry backoffs
    pub fn on_timer(&mut self, now: Instant) {
        self.flush_due(now);
        self.reconciler.fire_due_retries(now);
        self.banner.sync_endpoints(self.reconciler.errors());
    }

    /// Earliest debounce deadline or scheduled retry
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.debouncer.next_deadline(), self.reconciler.next_retry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run timers and completions until no edit is pending and no call is
    /// running or scheduled
    pub async fn settle(&mut self) {
        while !(self.reconciler.is_idle() && self.debouncer.is_empty()) {
            let wake = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                Some(completion) = self.reconciler.next_completion() => {
                    self.handle_completion(completion).await;
                }
                _ = tokio::time::sleep_until(wake) => {
                    self.on_timer(Instant::now());
                }
            }
        }
    }

    /// Merge endpoint changes made by other processes (`ngext enable`, ...).
    ///
    /// Enable/disable changes apply at once; option changes go through the
    /// debounce window. Returns whether anything changed.
    pub fn reload_store(&mut self) -> Result<bool> {
        let Some(paths) = &self.paths else {
            return Ok(false);
        };
        let disk = EndpointStore::load_from(&paths.store)?;
        let now = Instant::now();
        let mut changed = Vec::new();

        for config in disk.endpoints.values() {
            let key = config.key();
            match self.intents.get(&key) {
                Some(current) if current.same_intent(config) => {}
                Some(current) if current.enabled == config.enabled => {
                    if self.debouncer.pending(&key) != Some(&config.options) {
                        tracing::debug!("Options of {} changed on disk", key);
                        self.debouncer.edit(key, config.options.clone(), now);
                    }
                }
                _ => {
                    tracing::debug!("Endpoint {} changed on disk", key);
                    self.debouncer.cancel(&key);
                    self.banner.clear(&BannerKey::Save(key.clone()));
                    self.intents.upsert(config.clone());
                    changed.push(key);
                }
            }
        }

        let removed: Vec<EndpointKey> = self
            .intents
            .list()
            .into_iter()
            .map(|c| c.key())
            .filter(|k| disk.get(k).is_none())
            .collect();
        for key in removed {
            self.debouncer.cancel(&key);
            self.intents.remove(&key);
            changed.push(key);
        }

        for key in &changed {
            self.sync_key(key);
        }
        Ok(!changed.is_empty())
    }

    pub fn rows(&self) -> Vec<PortRow> {
        self.registry.rows(&self.intents, &self.reconciler)
    }

    pub fn view(&self) -> ShellView {
        if !self.auth.is_setup() {
            return ShellView::Setup {
                last_error: self.auth.last_error().map(str::to_string),
            };
        }
        ShellView::Dashboard {
            rows: self.rows(),
            banner: self.banner.entries(),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            pid: std::process::id(),
            updated_at: Utc::now(),
            auth: self.auth.status(),
            rows: if self.auth.is_setup() { self.rows() } else { Vec::new() },
            banner: self.banner.entries(),
        }
    }

    /// Publish the current status for one-shot CLI commands
    pub fn write_snapshot(&self) {
        if let Some(paths) = &self.paths {
            if let Err(e) = self.snapshot().save_to(&paths.status) {
                tracing::warn!("Failed to write status snapshot: {}", e);
            }
        }
    }

    /// Event loop of the daemon; returns after `shutdown` resolves and the
    /// tunnels were torn down, with the keys that may still be live.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Vec<EndpointKey>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut poll = tokio::time::interval(self.config.sync.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;
        let mut reload = tokio::time::interval(self.config.sync.reload_interval());
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reload.tick().await;
        let mut auth_check = tokio::time::interval(self.config.sync.auth_check_interval());
        auth_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        auth_check.tick().await;

        self.write_snapshot();
        loop {
            let wake = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down");
                    break;
                }
                _ = poll.tick() => self.poll().await,
                _ = auth_check.tick() => {
                    if self.auth.is_setup() {
                        self.check_auth().await;
                    }
                }
                _ = reload.tick() => {
                    if let Err(e) = self.reload_store() {
                        tracing::warn!("Failed to reload endpoint store: {}", e);
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    self.on_timer(Instant::now());
                }
                Some(completion) = self.reconciler.next_completion() => {
                    self.handle_completion(completion).await;
                }
            }
            self.write_snapshot();
        }

        self.shutdown().await
    }

    /// Delete every tunnel within the shutdown timeout; returns the keys that
    /// may still be live
    pub async fn shutdown(&mut self) -> Vec<EndpointKey> {
        let remaining = self
            .reconciler
            .shutdown(self.config.sync.shutdown_timeout())
            .await;
        if let Some(paths) = &self.paths {
            if paths.status.exists() {
                if let Err(e) = std::fs::remove_file(&paths.status) {
                    tracing::debug!("Could not remove status file: {}", e);
                }
            }
        }
        remaining
    }

    fn require_setup(&self) -> Result<()> {
        if self.auth.is_setup() {
            Ok(())
        } else {
            Err(CoreError::NotSetup)
        }
    }

    /// The container name for a tunnelable `key`
    fn require_port(&self, key: &EndpointKey) -> Result<String> {
        let container = self
            .registry
            .get(&key.container_id)
            .ok_or_else(|| CoreError::ContainerNotFound(key.container_id.to_string()))?;
        if container.port(key.port).is_some() {
            return Ok(container.name.clone());
        }
        if container.ports.iter().any(|p| p.port == key.port) {
            Err(CoreError::PortNotTunnelable {
                container: container.name.clone(),
                port: key.port,
            })
        } else {
            Err(CoreError::PortNotFound {
                container: container.name.clone(),
                port: key.port,
            })
        }
    }

    fn commit_options(&mut self, key: &EndpointKey, options: EndpointOptions) -> Result<()> {
        let config = match self.intents.get(key) {
            Some(current) if current.options == options => return Ok(()),
            Some(current) => {
                let mut config = current.clone();
                config.options = options;
                config.updated_at = Utc::now();
                config
            }
            None => {
                let name = self
                    .registry
                    .get(&key.container_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                EndpointConfig::new(key, name, false, options)
            }
        };
        self.commit(config)?;
        tracing::debug!("Committed options for {}", key);
        self.sync_key(key);
        Ok(())
    }

    /// Save `config`, then make it the committed intent; nothing changes in
    /// memory when the save fails
    fn commit(&mut self, config: EndpointConfig) -> Result<()> {
        let key = config.key();
        if let Some(paths) = &self.paths {
            let saved = config.clone();
            EndpointStore::update_at(&paths.store, |disk| disk.upsert(saved))?;
        }
        self.intents.upsert(config);
        self.banner.clear(&BannerKey::Save(key));
        Ok(())
    }

    fn keys_of(&self, container_id: &str) -> Vec<EndpointKey> {
        self.intents
            .list()
            .into_iter()
            .filter(|c| c.container_id == container_id)
            .map(|c| c.key())
            .collect()
    }

    fn desired_for(&self, key: &EndpointKey) -> Option<TunnelSpec> {
        let config = self.intents.get(key).filter(|c| c.enabled)?;
        let (container, port) = self.registry.tunnel_port(key)?;
        if let Err(e) = validate(&config.options) {
            tracing::warn!("Not tunneling {}: {}", key, e);
            return None;
        }
        let scheme = self
            .schemes
            .get(key)
            .unwrap_or(&self.config.ngrok.default_scheme);
        Some(derive_spec(container, port, &config.options, scheme))
    }

    fn sync_key(&mut self, key: &EndpointKey) {
        let desired = self.desired_for(key);
        self.reconciler.set_desired(key, desired);
        self.banner.sync_endpoints(self.reconciler.errors());
    }

    /// Recompute the desired state of every known key
    fn sync_desired(&mut self) {
        let mut keys: Vec<EndpointKey> = self.intents.list().into_iter().map(|c| c.key()).collect();
        keys.extend(self.reconciler.views().into_iter().map(|v| v.key));
        keys.sort();
        keys.dedup();
        for key in &keys {
            self.sync_key(key);
        }
    }

    fn persist(&self, key: &EndpointKey) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        let config = self.intents.get(key).cloned();
        EndpointStore::update_at(&paths.store, |disk| match config {
            Some(config) => disk.upsert(config),
            None => {
                disk.remove(key);
            }
        })
    }

    fn persist_keys(&self, keys: &[EndpointKey]) {
        for key in keys {
            if let Err(e) = self.persist(key) {
                tracing::warn!("Failed to save endpoint {}: {}", key, e);
            }
        }
    }
}
