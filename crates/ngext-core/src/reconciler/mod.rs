//! Tunnel reconciliation
//!
//! The reconciler keeps one entry per endpoint key holding the desired tunnel
//! spec, the tunnel the service last confirmed, and at most one in-flight
//! call. Calls run as spawned tasks behind a shared semaphore and report back
//! through a channel; the owner feeds each [`Completion`] into
//! [`Reconciler::handle_completion`], which records the result and issues the
//! next call if desired and actual still differ.
//!
//! Every desired-state change bumps the key's generation. A completion from an
//! older generation still updates the recorded actual tunnel, but its status
//! and error are dropped and the current desired state is planned again.

mod plan;

pub use plan::Operation;
use plan::{plan, Step};

use chrono::{DateTime, Utc};
use ngext_config::{GlobalConfig, RetryConfig};
use ngext_provider::{
    ContainerId, EndpointKey, TunnelError, TunnelErrorKind, TunnelInfo, TunnelService, TunnelSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long `run_until_idle` sleeps when only in-flight calls remain
const IDLE_WAKE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Bound on every tunnel service call
    pub call_timeout: Duration,
    /// Calls allowed to run at once across all keys
    pub max_in_flight: usize,
    pub retry: RetryConfig,
}

impl ReconcilerSettings {
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            call_timeout: config.sync.call_timeout(),
            max_in_flight: config.sync.max_in_flight,
            retry: config.retry.clone(),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&GlobalConfig::default())
    }
}

/// Lifecycle of one endpoint as shown to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    #[default]
    Disabled,
    Pending,
    Active,
    Error,
    Stopped,
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A failed tunnel call attached to its endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointError {
    pub key: EndpointKey,
    pub kind: TunnelErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
    /// The tunnel could not be deleted; cleanup keeps retrying in the background
    pub stop_failed: bool,
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.stop_failed {
            write!(f, "{}: could not stop tunnel ({}): {}", self.key, self.kind, self.message)
        } else {
            write!(f, "{}: {}: {}", self.key, self.kind, self.message)
        }
    }
}

/// A tunnel the service confirmed, with the spec it was created or updated from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualTunnel {
    pub info: TunnelInfo,
    pub applied: TunnelSpec,
}

/// Read-only state of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointView {
    pub key: EndpointKey,
    pub status: EndpointStatus,
    pub url: Option<String>,
    pub error: Option<EndpointError>,
    /// A call for this key is currently running
    pub busy: bool,
}

impl EndpointView {
    fn disabled(key: &EndpointKey) -> Self {
        Self {
            key: key.clone(),
            status: EndpointStatus::Disabled,
            url: None,
            error: None,
            busy: false,
        }
    }
}

/// Notable outcomes of handling a completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    Active { key: EndpointKey, url: String },
    /// The key settled as disabled and was forgotten
    Removed { key: EndpointKey },
    Failed(EndpointError),
    /// The service no longer accepts the token; auth must be checked again
    AuthExpired { key: EndpointKey },
}

/// Result of one tunnel call, delivered to the reconciler's owner
#[derive(Debug)]
pub struct Completion {
    key: EndpointKey,
    generation: u64,
    operation: Operation,
    result: Result<Option<TunnelInfo>, TunnelError>,
}

impl Completion {
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }
}

#[derive(Default)]
struct Entry {
    desired: Option<TunnelSpec>,
    actual: Option<ActualTunnel>,
    status: EndpointStatus,
    error: Option<EndpointError>,
    generation: u64,
    /// Task running the key's outstanding call
    in_flight: Option<JoinHandle<()>>,
    /// Automatic retry scheduled for this instant
    retry_at: Option<Instant>,
    /// Consecutive failures of the current generation
    failures: u32,
    /// Failed for good; waits for a desired-state change or a manual retry
    halted: bool,
}

impl Entry {
    /// Status while a call is outstanding and no error is shown
    fn working_status(&self) -> EndpointStatus {
        if self.desired.is_some() {
            EndpointStatus::Pending
        } else {
            EndpointStatus::Stopped
        }
    }

    fn clear_error(&mut self) {
        self.error = None;
        self.failures = 0;
        self.retry_at = None;
        self.halted = false;
    }

    fn view(&self, key: &EndpointKey) -> EndpointView {
        EndpointView {
            key: key.clone(),
            status: self.status,
            url: self.actual.as_ref().map(|a| a.info.url.clone()),
            error: self.error.clone(),
            busy: self.in_flight.is_some(),
        }
    }
}

pub struct Reconciler {
    service: Arc<dyn TunnelService>,
    settings: ReconcilerSettings,
    entries: BTreeMap<EndpointKey, Entry>,
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    /// Calls are only issued while ngrok is set up
    gate_open: bool,
}

impl Reconciler {
    /// Create a reconciler; the gate starts closed
    pub fn new(service: Arc<dyn TunnelService>, settings: ReconcilerSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            service,
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            settings,
            entries: BTreeMap::new(),
            tx,
            rx,
            gate_open: false,
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    pub fn is_gate_open(&self) -> bool {
        self.gate_open
    }

    /// Open or close the auth gate. Opening resumes every held key, including
    /// keys that stopped on an expired token.
    pub fn set_gate(&mut self, open: bool) {
        if self.gate_open == open {
            return;
        }
        self.gate_open = open;
        if !open {
            tracing::debug!("Tunnel calls held until ngrok is set up again");
            return;
        }

        tracing::debug!("Tunnel calls enabled");
        for entry in self.entries.values_mut() {
            let auth_halted = entry
                .error
                .as_ref()
                .is_some_and(|e| e.kind == TunnelErrorKind::AuthExpired);
            if entry.halted && auth_halted {
                entry.clear_error();
                entry.status = entry.working_status();
            }
        }
        self.kick();
    }

    /// Set what should exist for `key`; `None` means no tunnel.
    ///
    /// Setting the same value again does nothing. While a call for the key is
    /// running, the new value waits and only the latest one is applied.
    pub fn set_desired(&mut self, key: &EndpointKey, desired: Option<TunnelSpec>) {
        if desired.is_none() && !self.entries.contains_key(key) {
            return;
        }
        let entry = self.entries.entry(key.clone()).or_default();
        if entry.desired == desired {
            return;
        }

        tracing::debug!(
            "Desired state of {} changed to {}",
            key,
            if desired.is_some() { "enabled" } else { "disabled" }
        );
        entry.desired = desired;
        entry.generation += 1;
        entry.clear_error();

        if entry.in_flight.is_some() {
            entry.status = entry.working_status();
            return;
        }
        self.drive(key);
    }

    /// Disable every endpoint of a container that went away
    pub fn container_removed(&mut self, container_id: &ContainerId) -> usize {
        let keys: Vec<EndpointKey> = self
            .entries
            .keys()
            .filter(|k| &k.container_id == container_id)
            .cloned()
            .collect();
        for key in &keys {
            self.set_desired(key, None);
        }
        keys.len()
    }

    /// Manual retry of a key in `Error`. Returns false if there was nothing to retry.
    pub fn retry(&mut self, key: &EndpointKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.error.is_none() && entry.retry_at.is_none() {
            return false;
        }

        tracing::info!("Retrying {}", key);
        entry.clear_error();
        entry.status = entry.working_status();
        if entry.in_flight.is_none() {
            self.drive(key);
        }
        true
    }

    /// Plan every idle key again
    pub fn kick(&mut self) {
        let keys: Vec<EndpointKey> = self.entries.keys().cloned().collect();
        for key in keys {
            self.drive(&key);
        }
    }

    /// Wait for the next call to finish
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Record a finished call and issue whatever comes next for its key
    pub fn handle_completion(&mut self, completion: Completion) -> Vec<ReconcileEvent> {
        let Completion {
            key,
            generation,
            operation,
            result,
        } = completion;
        let retry = self.settings.retry.clone();
        let mut events = Vec::new();

        let Some(entry) = self.entries.get_mut(&key) else {
            tracing::debug!("Dropping completion for unknown endpoint {}", key);
            return events;
        };
        // One call per key, so this completion is the in-flight one
        entry.in_flight = None;
        let current = generation == entry.generation;

        if let (Operation::Update(..), Err(err)) = (&operation, &result) {
            if err.previous_removed {
                tracing::debug!("Failed update of {} left no tunnel behind", key);
                entry.actual = None;
            }
        }

        match result {
            Ok(info) => {
                entry.actual = match (operation, info) {
                    (Operation::Create(spec), Some(info)) | (Operation::Update(_, spec), Some(info)) => {
                        Some(ActualTunnel {
                            info,
                            applied: spec,
                        })
                    }
                    _ => None,
                };
                if current {
                    entry.clear_error();
                }
            }
            Err(err) if !current => {
                tracing::debug!(
                    "Ignoring stale {} failure for {}: {}",
                    operation.name(),
                    key,
                    err
                );
            }
            Err(err) => {
                entry.failures += 1;
                let stop_failed = operation.is_delete() && entry.desired.is_none();
                tracing::warn!(
                    "Tunnel {} for {} failed (attempt {}): {}",
                    operation.name(),
                    key,
                    entry.failures,
                    err
                );

                let error = EndpointError {
                    key: key.clone(),
                    kind: err.kind,
                    message: err.message,
                    at: Utc::now(),
                    stop_failed,
                };
                entry.status = EndpointStatus::Error;
                entry.error = Some(error.clone());
                events.push(ReconcileEvent::Failed(error));

                if err.kind == TunnelErrorKind::AuthExpired {
                    entry.halted = true;
                    events.push(ReconcileEvent::AuthExpired { key: key.clone() });
                } else if stop_failed || (err.kind.is_transient() && entry.failures <= retry.max_retries)
                {
                    let delay = retry.delay_for(entry.failures);
                    tracing::debug!("Retrying {} of {} in {:?}", operation.name(), key, delay);
                    entry.retry_at = Some(Instant::now() + delay);
                } else {
                    entry.halted = true;
                }
            }
        }

        events.extend(self.drive(&key));
        events
    }

    /// Issue the retries whose backoff elapsed at `now`
    pub fn fire_due_retries(&mut self, now: Instant) -> Vec<ReconcileEvent> {
        let due: Vec<EndpointKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.retry_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        let mut events = Vec::new();
        for key in due {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.retry_at = None;
            }
            events.extend(self.drive(&key));
        }
        events
    }

    /// Earliest scheduled automatic retry
    pub fn next_retry(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.retry_at).min()
    }

    /// No call is running and no retry is scheduled
    pub fn is_idle(&self) -> bool {
        self.entries
            .values()
            .all(|e| e.in_flight.is_none() && e.retry_at.is_none())
    }

    /// Process completions and retries until the reconciler is idle
    pub async fn run_until_idle(&mut self) -> Vec<ReconcileEvent> {
        let mut events = Vec::new();
        while !self.is_idle() {
            let wake = self
                .next_retry()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                Some(completion) = self.rx.recv() => {
                    events.extend(self.handle_completion(completion));
                }
                _ = tokio::time::sleep_until(wake) => {
                    events.extend(self.fire_due_retries(Instant::now()));
                }
            }
        }
        events
    }

    /// Delete every tunnel and wait up to `limit` for the deletions.
    ///
    /// Returns the keys that may still have a live tunnel.
    pub async fn shutdown(&mut self, limit: Duration) -> Vec<EndpointKey> {
        // Deletes run even after auth was lost
        self.set_gate(true);
        let keys: Vec<EndpointKey> = self.entries.keys().cloned().collect();
        for key in &keys {
            self.set_desired(key, None);
        }

        if tokio::time::timeout(limit, self.run_until_idle()).await.is_err() {
            tracing::warn!("Tunnel cleanup did not finish within {:?}", limit);
        }

        let remaining: Vec<EndpointKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.actual.is_some() || e.in_flight.is_some())
            .map(|(k, _)| k.clone())
            .collect();

        for entry in self.entries.values_mut() {
            if let Some(handle) = entry.in_flight.take() {
                handle.abort();
            }
            entry.retry_at = None;
        }
        self.permits.close();

        if !remaining.is_empty() {
            tracing::warn!("{} tunnel(s) may still be live after shutdown", remaining.len());
        }
        remaining
    }

    pub fn status(&self, key: &EndpointKey) -> EndpointStatus {
        self.entries
            .get(key)
            .map(|e| e.status)
            .unwrap_or(EndpointStatus::Disabled)
    }

    pub fn view(&self, key: &EndpointKey) -> EndpointView {
        match self.entries.get(key) {
            Some(entry) => entry.view(key),
            None => EndpointView::disabled(key),
        }
    }

    /// Views of every tracked key, ordered by key
    pub fn views(&self) -> Vec<EndpointView> {
        self.entries.iter().map(|(k, e)| e.view(k)).collect()
    }

    pub fn actual(&self, key: &EndpointKey) -> Option<&ActualTunnel> {
        self.entries.get(key).and_then(|e| e.actual.as_ref())
    }

    pub fn desired(&self, key: &EndpointKey) -> Option<&TunnelSpec> {
        self.entries.get(key).and_then(|e| e.desired.as_ref())
    }

    /// Unresolved errors, most recent first
    pub fn errors(&self) -> Vec<EndpointError> {
        let mut errors: Vec<EndpointError> =
            self.entries.values().filter_map(|e| e.error.clone()).collect();
        errors.sort_by(|a, b| b.at.cmp(&a.at));
        errors
    }

    /// Walk one idle key toward its desired state
    fn drive(&mut self, key: &EndpointKey) -> Option<ReconcileEvent> {
        let gate_open = self.gate_open;
        let entry = self.entries.get_mut(key)?;
        if entry.in_flight.is_some() || entry.retry_at.is_some() || entry.halted {
            return None;
        }

        match plan(entry.desired.as_ref(), entry.actual.as_ref()) {
            Step::Settled => {
                if entry.desired.is_some() {
                    let url = entry
                        .actual
                        .as_ref()
                        .map(|a| a.info.url.clone())
                        .unwrap_or_default();
                    let changed = entry.status != EndpointStatus::Active;
                    entry.status = EndpointStatus::Active;
                    entry.clear_error();
                    if !changed {
                        return None;
                    }
                    tracing::debug!("{} is active at {}", key, url);
                    Some(ReconcileEvent::Active {
                        key: key.clone(),
                        url,
                    })
                } else {
                    self.entries.remove(key);
                    tracing::debug!("{} is disabled", key);
                    Some(ReconcileEvent::Removed { key: key.clone() })
                }
            }
            Step::Call(operation) => {
                if entry.error.is_none() {
                    entry.status = entry.working_status();
                }
                if !gate_open {
                    tracing::debug!("Holding {} of {} until ngrok is set up", operation.name(), key);
                    return None;
                }
                let generation = entry.generation;
                let handle = self.spawn_call(key.clone(), generation, operation);
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.in_flight = Some(handle);
                }
                None
            }
        }
    }

    fn spawn_call(&self, key: EndpointKey, generation: u64, operation: Operation) -> JoinHandle<()> {
        let service = self.service.clone();
        let permits = self.permits.clone();
        let tx = self.tx.clone();
        let limit = self.settings.call_timeout;
        tracing::debug!("Issuing tunnel {} for {}", operation.name(), key);

        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => call(service.as_ref(), &operation, limit).await,
                Err(_) => Err(TunnelError::new(
                    TunnelErrorKind::Unknown,
                    "tunnel calls are shut down",
                )),
            };
            // The receiver only goes away with the reconciler itself
            let _ = tx.send(Completion {
                key,
                generation,
                operation,
                result,
            });
        })
    }
}

/// Run one operation against the service, bounded by `limit`
async fn call(
    service: &dyn TunnelService,
    operation: &Operation,
    limit: Duration,
) -> Result<Option<TunnelInfo>, TunnelError> {
    let request = async {
        match operation {
            Operation::Create(spec) => service.create_tunnel(spec).await.map(Some),
            Operation::Update(id, spec) => service.update_tunnel(id, spec).await.map(Some),
            Operation::Delete(id) => service.delete_tunnel(id).await.map(|_| None),
        }
    };
    match tokio::time::timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::timeout()),
    }
}
