//! Test support utilities for ngext-core
//!
//! Provides MockHost and MockTunnelService so the reconciler, registry and
//! shell can be exercised without Docker or an ngrok agent.

use async_trait::async_trait;
use ngext_provider::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records which methods were called on the mocks
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    ListContainers,
    OpenExternal { url: String },
    GetToken,
    SetToken { token: String },
    ClearToken,
    ValidateToken { token: String },
    Create { key: EndpointKey, pooling: bool, description: String, metadata: String },
    Update { id: String, key: EndpointKey, pooling: bool, description: String, metadata: String },
    Delete { id: String },
}

impl MockCall {
    /// Whether this call reached the tunnel service's tunnel API
    pub fn is_tunnel_call(&self) -> bool {
        matches!(
            self,
            MockCall::Create { .. } | MockCall::Update { .. } | MockCall::Delete { .. }
        )
    }
}

/// Configurable mock container host
pub struct MockHost {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    containers: Mutex<Vec<Container>>,
    list_error: Mutex<Option<String>>,
    token: Mutex<Option<String>>,
    token_read_error: Mutex<Option<String>>,
    token_writes: Mutex<usize>,
    /// Detected scheme per container port
    schemes: Mutex<HashMap<u16, String>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            containers: Mutex::new(Vec::new()),
            list_error: Mutex::new(None),
            token: Mutex::new(None),
            token_read_error: Mutex::new(None),
            token_writes: Mutex::new(0),
            schemes: Mutex::new(HashMap::new()),
        }
    }

    /// Report `scheme` for every container port numbered `port`
    pub fn with_scheme(self, port: u16, scheme: &str) -> Self {
        self.schemes.lock().unwrap().insert(port, scheme.to_string());
        self
    }

    pub fn with_token(self, token: &str) -> Self {
        *self.token.lock().unwrap() = Some(token.to_string());
        self
    }

    pub fn with_containers(self, containers: Vec<Container>) -> Self {
        *self.containers.lock().unwrap() = containers;
        self
    }

    pub fn set_containers(&self, containers: Vec<Container>) {
        *self.containers.lock().unwrap() = containers;
    }

    /// Make `list_containers` fail (Some) or succeed again (None)
    pub fn set_list_error(&self, error: Option<String>) {
        *self.list_error.lock().unwrap() = error;
    }

    pub fn set_token_read_error(&self, error: Option<String>) {
        *self.token_read_error.lock().unwrap() = error;
    }

    /// Simulate the token being removed outside the process
    pub fn remove_token(&self) {
        *self.token.lock().unwrap() = None;
    }

    pub fn stored_token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    pub fn token_writes(&self) -> usize {
        *self.token_writes.lock().unwrap()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerHost for MockHost {
    async fn list_containers(&self) -> Result<Vec<Container>> {
        self.record(MockCall::ListContainers);
        if let Some(err) = self.list_error.lock().unwrap().as_ref() {
            return Err(ProviderError::ConnectionError(err.clone()));
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn open_external(&self, url: &str) -> Result<()> {
        self.record(MockCall::OpenExternal {
            url: url.to_string(),
        });
        Ok(())
    }

    async fn get_stored_auth_token(&self) -> Result<Option<String>> {
        self.record(MockCall::GetToken);
        if let Some(err) = self.token_read_error.lock().unwrap().as_ref() {
            return Err(ProviderError::TokenStorage(err.clone()));
        }
        Ok(self.token.lock().unwrap().clone())
    }

    async fn set_stored_auth_token(&self, token: &str) -> Result<()> {
        self.record(MockCall::SetToken {
            token: token.to_string(),
        });
        *self.token.lock().unwrap() = Some(token.to_string());
        *self.token_writes.lock().unwrap() += 1;
        Ok(())
    }

    async fn clear_stored_auth_token(&self) -> Result<()> {
        self.record(MockCall::ClearToken);
        *self.token.lock().unwrap() = None;
        Ok(())
    }

    async fn detect_scheme(&self, port: &ExposedPort) -> Option<String> {
        self.schemes.lock().unwrap().get(&port.port).cloned()
    }
}

/// Configurable mock tunnel service that tracks which tunnels are live
pub struct MockTunnelService {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    validate_result: Mutex<std::result::Result<(), AuthError>>,
    /// Failures handed out to the next tunnel calls, in order
    scripted_failures: Mutex<VecDeque<TunnelError>>,
    /// Failure returned by every tunnel call while set
    failure: Mutex<Option<TunnelError>>,
    delay: Mutex<Duration>,
    /// Updates stop the tunnel before starting it again, like the ngrok agent
    replacing_updates: Mutex<bool>,
    live: Mutex<HashMap<TunnelId, TunnelSpec>>,
    max_live_per_key: Mutex<usize>,
    in_flight: Mutex<usize>,
    max_in_flight: Mutex<usize>,
}

impl MockTunnelService {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            validate_result: Mutex::new(Ok(())),
            scripted_failures: Mutex::new(VecDeque::new()),
            failure: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            replacing_updates: Mutex::new(false),
            live: Mutex::new(HashMap::new()),
            max_live_per_key: Mutex::new(0),
            in_flight: Mutex::new(0),
            max_in_flight: Mutex::new(0),
        }
    }

    pub fn set_validate_result(&self, result: std::result::Result<(), AuthError>) {
        *self.validate_result.lock().unwrap() = result;
    }

    /// Fail the next tunnel call with `error`
    pub fn fail_next(&self, error: TunnelError) {
        self.scripted_failures.lock().unwrap().push_back(error);
    }

    /// Fail every tunnel call until cleared with `None`
    pub fn set_failure(&self, error: Option<TunnelError>) {
        *self.failure.lock().unwrap() = error;
    }

    /// Delay every tunnel call by `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Make updates stop the old tunnel first; a failure then leaves none
    pub fn set_replacing_updates(&self, replacing: bool) {
        *self.replacing_updates.lock().unwrap() = replacing;
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tunnel_calls(&self) -> Vec<MockCall> {
        self.get_calls()
            .into_iter()
            .filter(MockCall::is_tunnel_call)
            .collect()
    }

    pub fn was_called(&self, call: &MockCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    /// Specs of the tunnels currently live for `key`
    pub fn live_for(&self, key: &EndpointKey) -> Vec<TunnelSpec> {
        self.live
            .lock()
            .unwrap()
            .values()
            .filter(|s| &s.key == key)
            .cloned()
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Highest number of simultaneously live tunnels ever seen for one key
    pub fn max_live_per_key(&self) -> usize {
        *self.max_live_per_key.lock().unwrap()
    }

    /// Highest number of simultaneously running tunnel calls
    pub fn max_in_flight(&self) -> usize {
        *self.max_in_flight.lock().unwrap()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Enter a call: wait out the configured delay and pick its failure, if any
    async fn begin(&self) -> Option<TunnelError> {
        {
            let mut n = self.in_flight.lock().unwrap();
            *n += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            *max = (*max).max(*n);
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        *self.in_flight.lock().unwrap() -= 1;

        if let Some(err) = self.scripted_failures.lock().unwrap().pop_front() {
            return Some(err);
        }
        self.failure.lock().unwrap().clone()
    }

    fn insert_live(&self, id: TunnelId, spec: TunnelSpec) {
        let mut live = self.live.lock().unwrap();
        let key = spec.key.clone();
        live.insert(id, spec);
        let count = live.values().filter(|s| s.key == key).count();
        let mut max = self.max_live_per_key.lock().unwrap();
        *max = (*max).max(count);
    }
}

impl Default for MockTunnelService {
    fn default() -> Self {
        Self::new()
    }
}

fn public_url(id: &TunnelId) -> String {
    let short: String = id.0.chars().skip(3).take(8).collect();
    format!("https://{}.ngrok.app", short)
}

#[async_trait]
impl TunnelService for MockTunnelService {
    async fn validate_token(&self, token: &str) -> std::result::Result<(), AuthError> {
        self.record(MockCall::ValidateToken {
            token: token.to_string(),
        });
        self.validate_result.lock().unwrap().clone()
    }

    async fn create_tunnel(&self, spec: &TunnelSpec) -> std::result::Result<TunnelInfo, TunnelError> {
        self.record(MockCall::Create {
            key: spec.key.clone(),
            pooling: spec.pooling_enabled,
            description: spec.description.clone(),
            metadata: spec.metadata.clone(),
        });
        if let Some(err) = self.begin().await {
            return Err(err);
        }

        let id = TunnelId::new(format!("tn_{}", uuid::Uuid::new_v4().simple()));
        let url = public_url(&id);
        self.insert_live(id.clone(), spec.clone());
        Ok(TunnelInfo {
            id,
            url,
            status: TunnelStatus::Active,
        })
    }

    async fn update_tunnel(
        &self,
        id: &TunnelId,
        spec: &TunnelSpec,
    ) -> std::result::Result<TunnelInfo, TunnelError> {
        self.record(MockCall::Update {
            id: id.0.clone(),
            key: spec.key.clone(),
            pooling: spec.pooling_enabled,
            description: spec.description.clone(),
            metadata: spec.metadata.clone(),
        });
        if *self.replacing_updates.lock().unwrap() {
            let stopped = self.live.lock().unwrap().remove(id).is_some();
            if let Some(err) = self.begin().await {
                return Err(if stopped { err.with_previous_removed() } else { err });
            }
            self.insert_live(id.clone(), spec.clone());
            return Ok(TunnelInfo {
                id: id.clone(),
                url: public_url(id),
                status: TunnelStatus::Active,
            });
        }
        if let Some(err) = self.begin().await {
            return Err(err);
        }

        let mut live = self.live.lock().unwrap();
        match live.get_mut(id) {
            Some(existing) => {
                *existing = spec.clone();
                Ok(TunnelInfo {
                    id: id.clone(),
                    url: public_url(id),
                    status: TunnelStatus::Active,
                })
            }
            None => Err(TunnelError::new(
                TunnelErrorKind::ValidationRejectedByService,
                format!("tunnel {} not found", id),
            )),
        }
    }

    async fn delete_tunnel(&self, id: &TunnelId) -> std::result::Result<(), TunnelError> {
        self.record(MockCall::Delete { id: id.0.clone() });
        if let Some(err) = self.begin().await {
            return Err(err);
        }
        self.live.lock().unwrap().remove(id);
        Ok(())
    }
}

/// A running container exposing the given TCP ports
pub fn mock_container(id: &str, name: &str, ports: &[u16]) -> Container {
    Container {
        id: ContainerId::new(id),
        name: name.to_string(),
        image: format!("{}:latest", name),
        ports: ports.iter().map(|p| ExposedPort::tcp(*p)).collect(),
        labels: HashMap::new(),
    }
}
